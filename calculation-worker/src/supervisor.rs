use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::consumer::ConsumeLoop;
use crate::error::WorkerError;

/// Runs every consume loop concurrently under one cancellation token.
pub struct Supervisor {
    loops: Vec<ConsumeLoop>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            loops: Vec::new(),
            cancel,
        }
    }

    pub fn add(&mut self, consume_loop: ConsumeLoop) {
        self.loops.push(consume_loop);
    }

    /// Waits for every loop to exit. The first loop to fail cancels the
    /// others, and its error is returned once they are all done.
    pub async fn run(self) -> Result<(), WorkerError> {
        let mut tasks = JoinSet::new();
        for consume_loop in self.loops {
            let topic = consume_loop.topic().to_owned();
            let cancel = self.cancel.clone();
            info!(topic = %topic, "starting consume loop");
            tasks.spawn(async move {
                consume_loop
                    .run(cancel)
                    .await
                    .map_err(|error| WorkerError::LoopStopped { topic, error })
            });
        }

        let mut outcome = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(join_error) => Err(WorkerError::LoopPanicked(join_error.to_string())),
            };

            if let Err(error) = result {
                error!(%error, "consume loop exited, shutting down the others");
                self.cancel.cancel();
                if outcome.is_ok() {
                    outcome = Err(error);
                }
            }
        }

        outcome
    }
}
