use std::sync::Arc;

use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    Error,
    receiver::{Cursor, LoopState},
};

/// Control handle of a running receive loop.
///
/// Returned by [`Receiver::start`](crate::Receiver::start). Dropping the handle does not stop the
/// loop; call [`ReceiverHandle::stop`] for that.
///
/// # Example
///
/// ```ignore
/// let handle = receiver.start(height, sequence, on_proofs, || info!("relay stopped"));
///
/// handle.stop();
/// handle.join().await?;
/// ```
#[derive(Debug)]
pub struct ReceiverHandle {
    pub(crate) state: Arc<watch::Sender<LoopState>>,
    pub(crate) cursor: watch::Receiver<Cursor>,
    pub(crate) cancel: CancellationToken,
    pub(crate) task: JoinHandle<Result<(), Error>>,
}

impl ReceiverHandle {
    /// Requests the loop to stop.
    ///
    /// The loop moves to [`LoopState::Stopping`] right away and to [`LoopState::Stopped`] once
    /// the stop callback has run. Stopping a loop that already ended has no effect.
    pub fn stop(&self) {
        let stopping = self.state.send_if_modified(|state| {
            if *state == LoopState::Running {
                *state = LoopState::Stopping;
                true
            } else {
                false
            }
        });
        if stopping {
            info!("Stopping receive loop");
        }
        self.cancel.cancel();
    }

    #[must_use]
    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Waits until the loop reaches `target` or a terminal state, returning the state reached.
    pub async fn wait_for_state(&self, target: LoopState) -> LoopState {
        let mut state = self.state.subscribe();
        match state.wait_for(|state| *state == target || state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Height and sequence bookkeeping after the last delivered block.
    #[must_use]
    pub fn cursor(&self) -> Cursor {
        *self.cursor.borrow()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the loop to end.
    ///
    /// # Errors
    ///
    /// Returns the error that faulted the loop:
    ///
    /// * [`Error::HeightMismatch`] - the monitor delivered a block out of order.
    /// * [`Error::Delivery`] - the relay callback rejected a batch.
    /// * [`Error::MonitorClosed`] - the block stream ended without a stop request.
    /// * any fatal block monitor error.
    pub async fn join(self) -> Result<(), Error> {
        match self.task.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(Error::MonitorClosed),
        }
    }
}
