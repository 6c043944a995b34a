// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::Error;

///
/// A cancellation scope passed into every public engine operation. Long loops (SCC analysis,
/// filesystem scans, replay) poll it at a bounded cadence; everything else checks it before
/// entering a critical section.
///
#[derive(Clone)]
pub struct Context {
    receiver: watch::Receiver<bool>,
}

///
/// The write half of a Context: triggering it cancels every clone of the associated Context.
///
pub struct CancellationHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl Context {
    ///
    /// A Context that is never cancelled.
    ///
    pub fn background() -> Context {
        let (_sender, receiver) = watch::channel(false);
        // Dropping the sender freezes the value at `false`.
        Context { receiver }
    }

    ///
    /// A cancellable Context, and the handle that cancels it.
    ///
    pub fn cancellable() -> (Context, CancellationHandle) {
        let (sender, receiver) = watch::channel(false);
        (
            Context { receiver },
            CancellationHandle {
                sender: Arc::new(sender),
            },
        )
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    ///
    /// Returns `Error::Cancelled` if this Context has been cancelled.
    ///
    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl CancellationHandle {
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }
}
