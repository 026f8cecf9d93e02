use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::stream::{recv, send, ServerStream};
use super::Dispatcher;
use crate::errors::DispatchError;
use crate::models::{RunnerConfigRequest, RunnerConfigResponse};
use crate::registry::RunnerRegistry;

type ConfigStream = ServerStream<RunnerConfigRequest, RunnerConfigResponse>;

/// Deregisters the runner when the config stream ends, however it ends,
/// unless a newer stream has registered the same id since.
struct Registration<'a> {
    registry: &'a RunnerRegistry,
    id: String,
    generation: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.delete_generation(&self.id, self.generation);
    }
}

impl Dispatcher {
    /// Register a runner for the lifetime of the stream and push it the
    /// config vars that apply to it, again after every change.
    pub async fn runner_config(
        &self,
        token: CancellationToken,
        stream: ConfigStream,
    ) -> Result<(), DispatchError> {
        let ServerStream {
            mut incoming,
            outgoing,
        } = stream;
        let token = token.child_token();
        let _cancel_on_exit = token.clone().drop_guard();

        let runner = match recv(&mut incoming).await? {
            Some(RunnerConfigRequest::Open { runner }) => runner,
            None => {
                return Err(DispatchError::FailedPrecondition(
                    "expected open event, got end of stream".to_string(),
                ))
            }
        };

        let generation = self.runners.create(runner.clone());
        let _registration = Registration {
            registry: &self.runners,
            id: runner.id.clone(),
            generation,
        };

        tokio::spawn(watch_disconnect(token.clone(), incoming));

        let mut revision = self.config_vars.subscribe();
        loop {
            let config_vars = self.config_vars.for_runner(&runner);
            tracing::debug!(
                "Sending {} config vars to runner '{}'",
                config_vars.len(),
                runner.id
            );
            send(&outgoing, RunnerConfigResponse::Config { config_vars }).await?;

            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                changed = revision.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Runners send nothing after `Open`; the only thing to notice is the close.
async fn watch_disconnect(
    token: CancellationToken,
    mut incoming: mpsc::Receiver<Result<RunnerConfigRequest, DispatchError>>,
) {
    let _cancel_on_exit = token.clone().drop_guard();
    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => return,
            msg = recv(&mut incoming) => msg,
        };
        match msg {
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Config stream receive failed: {}", e);
                return;
            }
        }
    }
}
