// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as Sha256Digest, Sha256};

pub const FINGERPRINT_SIZE: usize = 32;

pub const EMPTY_FINGERPRINT: Fingerprint = Fingerprint([
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
]);
pub const EMPTY_DIGEST: Digest = Digest {
    hash: EMPTY_FINGERPRINT,
    size_bytes: 0,
};

///
/// A SHA-256 content fingerprint.
///
#[derive(Clone, Copy, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    pub fn from_bytes_unsafe(bytes: &[u8]) -> Fingerprint {
        if bytes.len() != FINGERPRINT_SIZE {
            panic!(
                "Input value was not a fingerprint; had length: {}",
                bytes.len()
            );
        }

        let mut fingerprint = [0; FINGERPRINT_SIZE];
        fingerprint.clone_from_slice(&bytes[0..FINGERPRINT_SIZE]);
        Fingerprint(fingerprint)
    }

    pub fn from_hex_string(hex_string: &str) -> Result<Fingerprint, String> {
        <[u8; FINGERPRINT_SIZE] as hex::FromHex>::from_hex(hex_string)
            .map(Fingerprint)
            .map_err(|e| format!("{e:?}"))
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    #[allow(clippy::wrong_self_convention)]
    pub fn to_hex(&self) -> String {
        let mut s = String::new();
        for &byte in &self.0 {
            fmt::Write::write_fmt(&mut s, format_args!("{byte:02x}")).unwrap();
        }
        s
    }

    ///
    /// The hex encoding of the first 16 bytes: a 32 character identifier that is short enough for
    /// filesystem use, but still collision resistant. Used as the on-disk checkpoint key for a
    /// project.
    ///
    pub fn prefix_hex(&self) -> String {
        let mut s = String::new();
        for &byte in &self.0[0..FINGERPRINT_SIZE / 2] {
            fmt::Write::write_fmt(&mut s, format_args!("{byte:02x}")).unwrap();
        }
        s
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint<{}>", self.to_hex())
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

impl Serialize for Fingerprint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.to_hex().as_str())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FingerprintVisitor;

        impl<'de> Visitor<'de> for FingerprintVisitor {
            type Value = Fingerprint;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> Result<(), fmt::Error> {
                formatter.write_str("struct Fingerprint")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Fingerprint::from_hex_string(v).map_err(|err| {
                    serde::de::Error::invalid_value(
                        serde::de::Unexpected::Str(&format!("{v:?}: {err}")),
                        &format!("A hex representation of a {FINGERPRINT_SIZE} byte value")
                            .as_str(),
                    )
                })
            }
        }

        deserializer.deserialize_string(FingerprintVisitor)
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Fingerprint::from_hex_string(s)
    }
}

///
/// A Digest is a fingerprint, as well as the size in bytes of the plaintext for which that is the
/// fingerprint.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    pub hash: Fingerprint,
    pub size_bytes: usize,
}

impl Digest {
    pub fn new(hash: Fingerprint, size_bytes: usize) -> Digest {
        Digest { hash, size_bytes }
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::default();
        hasher.update(bytes);
        let hash: [u8; FINGERPRINT_SIZE] = hasher.finalize().into();

        Digest::new(Fingerprint(hash), bytes.len())
    }
}

///
/// A Write instance that fingerprints all data that passes through it.
///
pub struct WriterHasher<T> {
    hasher: Sha256,
    byte_count: usize,
    inner: T,
}

impl<T> WriterHasher<T> {
    pub fn new(inner: T) -> WriterHasher<T> {
        WriterHasher {
            hasher: Sha256::default(),
            byte_count: 0,
            inner: inner,
        }
    }

    ///
    /// Returns the result of fingerprinting this stream, and Drops the stream.
    ///
    pub fn finish(self) -> (Digest, T) {
        let hash: [u8; FINGERPRINT_SIZE] = self.hasher.finalize().into();
        (Digest::new(Fingerprint(hash), self.byte_count), self.inner)
    }
}

impl<W: Write> Write for WriterHasher<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        // Hash the bytes that were successfully written.
        self.hasher.update(&buf[0..written]);
        self.byte_count += written;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

///
/// Copy the data from reader to writer and hash the bytes in one pass.
///
pub fn sync_copy_and_hash<R: ?Sized, W: ?Sized>(
    reader: &mut R,
    writer: &mut W,
) -> io::Result<Digest>
where
    R: io::Read,
    W: io::Write,
{
    let mut hasher = WriterHasher::new(writer);
    let _ = io::copy(reader, &mut hasher)?;
    Ok(hasher.finish().0)
}

///
/// Copy from reader to writer and return whether the copied data matches expected_digest.
///
pub fn sync_verified_copy<R: ?Sized, W: ?Sized>(
    expected_digest: Digest,
    reader: &mut R,
    writer: &mut W,
) -> io::Result<bool>
where
    R: io::Read,
    W: io::Write,
{
    Ok(expected_digest == sync_copy_and_hash(reader, writer)?)
}

///
/// A Read instance that fingerprints all data that passes through it.
///
pub struct ReaderHasher<T> {
    hasher: Sha256,
    byte_count: usize,
    inner: T,
}

impl<T> ReaderHasher<T> {
    pub fn new(inner: T) -> ReaderHasher<T> {
        ReaderHasher {
            hasher: Sha256::default(),
            byte_count: 0,
            inner: inner,
        }
    }

    ///
    /// Returns the result of fingerprinting this stream, and Drops the stream.
    ///
    pub fn finish(self) -> (Digest, T) {
        let hash: [u8; FINGERPRINT_SIZE] = self.hasher.finalize().into();
        (Digest::new(Fingerprint(hash), self.byte_count), self.inner)
    }
}

impl<R: io::Read> io::Read for ReaderHasher<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        // Hash the bytes that were successfully read.
        self.hasher.update(&buf[0..read]);
        self.byte_count += read;
        Ok(read)
    }
}

///
/// A streaming hasher for content that arrives in chunks (e.g. lock file contents), where no
/// destination writer is involved.
///
pub struct StreamingHasher {
    hasher: Sha256,
    byte_count: usize,
}

impl StreamingHasher {
    pub fn new() -> StreamingHasher {
        StreamingHasher {
            hasher: Sha256::default(),
            byte_count: 0,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.byte_count += bytes.len();
    }

    pub fn finish(self) -> Digest {
        let hash: [u8; FINGERPRINT_SIZE] = self.hasher.finalize().into();
        Digest::new(Fingerprint(hash), self.byte_count)
    }
}

///
/// The lexical shape required of a project hash: between 8 and 64 characters, each of which is
/// lowercase hex. Checkpoint keys (see `Fingerprint::prefix_hex`) satisfy this check.
///
pub fn is_valid_project_hash(s: &str) -> bool {
    (8..=64).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}


#[cfg(test)]
mod hasher_tests;
