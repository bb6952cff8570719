// Copyright 2024 The NativeLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cooperative cancellation, shared by the scheduler and every stage it
//! supervises. Built on `tokio::sync::watch` rather than a dedicated
//! cancellation crate, following the teacher's preference for
//! composing primitives from `tokio::sync` directly.

use tokio::sync::watch;

/// The writer half, held by the supervisor. Cloning a `CancelSource`
/// does not create independent cancellation domains; all clones signal
/// the same token.
#[derive(Clone)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

/// The reader half, handed to a stage's worker pool. Cheap to clone —
/// every worker gets its own.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

#[must_use]
pub fn cancel_pair() -> (CancelSource, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelSource { tx }, CancelToken { rx })
}

impl CancelSource {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. A worker awaits this
    /// between records, never mid-record, so a record's promotion is
    /// never observed half-committed.
    pub async fn cancelled(&mut self) {
        let _ = self.rx.changed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_observes_cancellation() {
        let (source, token) = cancel_pair();
        assert!(!token.is_cancelled());
        source.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cloned_tokens_share_the_same_signal() {
        let (source, token) = cancel_pair();
        let cloned = token.clone();
        source.cancel();
        assert!(token.is_cancelled());
        assert!(cloned.is_cancelled());
    }
}
