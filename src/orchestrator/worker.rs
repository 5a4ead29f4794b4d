use crossbeam::channel::{select, tick, Receiver, TryRecvError};
use tracing::{debug, error, info};

use crate::error::Result;
use crate::orchestrator::{run_once, PipelineContext};

/// Polls a fixed set of queues in order.
pub struct Worker {
    queues: Vec<String>,
}

impl Worker {
    pub fn new(queues: Vec<String>) -> Self {
        Self { queues }
    }

    /// Runs jobs until a full pass over every queue finds nothing dispatchable.
    /// Returns how many jobs were executed.
    pub fn drain(&self, ctx: &mut PipelineContext) -> Result<usize> {
        self.drain_until(ctx, None).map(|(executed, _)| executed)
    }

    /// Like `drain`, but stops early once `shutdown` fires. The flag reports that it did.
    fn drain_until(
        &self,
        ctx: &mut PipelineContext,
        shutdown: Option<&Receiver<()>>,
    ) -> Result<(usize, bool)> {
        let mut executed = 0;
        loop {
            let mut this_pass = 0;
            for queue in &self.queues {
                while run_once(ctx, queue)?.is_some() {
                    this_pass += 1;
                    if stop_requested(shutdown) {
                        return Ok((executed + this_pass, true));
                    }
                }
            }
            executed += this_pass;
            if this_pass == 0 {
                return Ok((executed, false));
            }
        }
    }

    /// Blocks, draining the queues on every tick, until `shutdown` fires or its sender is dropped.
    pub fn run(&self, ctx: &mut PipelineContext, shutdown: Receiver<()>) -> Result<()> {
        info!("Worker polling {:?} every {:?}", self.queues, ctx.settings.poll_interval);
        let ticker = tick(ctx.settings.poll_interval);

        loop {
            match self.drain_until(ctx, Some(&shutdown)) {
                Ok((executed, stopped)) => {
                    if executed > 0 {
                        debug!("Executed {} job(s)", executed);
                    }
                    if stopped {
                        break;
                    }
                }
                Err(e) => error!("Worker pass failed: {}", e),
            }

            select! {
                recv(shutdown) -> _ => break,
                recv(ticker) -> _ => {}
            }
        }

        info!("Worker shutting down");
        Ok(())
    }
}

fn stop_requested(shutdown: Option<&Receiver<()>>) -> bool {
    match shutdown {
        Some(rx) => !matches!(rx.try_recv(), Err(TryRecvError::Empty)),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SqliteStore;
    use crate::media::FfmpegSource;
    use crate::queue::{Broker, SqliteBroker, Task, QUEUE_PREDICTION};
    use crate::utils::Settings;
    use crossbeam::channel::bounded;
    use std::time::Duration;

    fn context() -> PipelineContext {
        PipelineContext::new(
            Settings {
                poll_interval: Duration::from_millis(10),
                ..Settings::default()
            },
            Box::new(SqliteStore::in_memory().unwrap()),
            Box::new(SqliteBroker::in_memory().unwrap()),
            Box::new(FfmpegSource::default()),
        )
    }

    #[test]
    fn drain_on_empty_queues_does_nothing() {
        let mut ctx = context();
        let worker = Worker::new(vec!["event_video".into()]);
        assert_eq!(worker.drain(&mut ctx).unwrap(), 0);
    }

    #[test]
    fn run_returns_once_shutdown_is_signalled() {
        let mut ctx = context();
        let worker = Worker::new(vec![QUEUE_PREDICTION.into()]);
        let (tx, rx) = bounded(1);
        tx.send(()).unwrap();
        worker.run(&mut ctx, rx).unwrap();
    }

    #[test]
    fn signal_during_a_pass_stops_the_worker() {
        let mut ctx = context();
        for name in ["a", "b"] {
            let task = Task::ClassifyFrame {
                event_name: name.into(),
                image_path: format!("/nonexistent/{}_f0.jpg", name),
            };
            ctx.broker
                .enqueue(task.queue(), &task, task.default_policy(), None, None)
                .unwrap();
        }

        // Consumed after the first job; the second is left for the next worker.
        let (tx, rx) = bounded(1);
        tx.send(()).unwrap();
        Worker::new(vec![QUEUE_PREDICTION.into()]).run(&mut ctx, rx).unwrap();
        assert_eq!(ctx.broker.get(2).unwrap().unwrap().attempts, 0);
    }

    #[test]
    fn run_stops_when_the_signal_sender_goes_away() {
        let mut ctx = context();
        let task = Task::ClassifyFrame {
            event_name: "e".into(),
            image_path: "/nonexistent/e_f0.jpg".into(),
        };
        let id = ctx
            .broker
            .enqueue(task.queue(), &task, task.default_policy(), None, None)
            .unwrap();

        let (tx, rx) = bounded::<()>(1);
        drop(tx);
        Worker::new(vec![QUEUE_PREDICTION.into()]).run(&mut ctx, rx).unwrap();

        // No classifier configured: the attempt failed and the job waits out its backoff.
        let job = ctx.broker.get(id).unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("classifier error: no still model configured"));
    }
}
