//! Image provisioning with per-image build de-duplication.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::watch;
use tracing::Instrument;

use crate::{
    config::ImageSource,
    error::OrchestratorError,
    runtime::{BuildSpec, ContainerRuntime, RuntimeError},
    support::format_error_chain,
};

/// `None` while in flight; the settled outcome afterwards.
type Outcome = Option<Result<(), String>>;

type InFlight = Arc<Mutex<HashMap<String, watch::Receiver<Outcome>>>>;

/// Removes the in-flight entry when the provisioning task ends, including by panic.
struct InFlightGuard {
    in_flight: InFlight,
    image: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.image);
    }
}

#[derive(Clone)]
pub struct ImageProvisioner {
    runtime: Arc<dyn ContainerRuntime>,
    in_flight: InFlight,
}

impl ImageProvisioner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of builds/pulls currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Makes sure `image` exists locally. Concurrent callers for the same image share one
    /// build/pull and observe the same outcome.
    pub async fn ensure_image(
        &self,
        image: &str,
        source: &ImageSource,
    ) -> Result<(), OrchestratorError> {
        let exists = self
            .runtime
            .image_exists(image)
            .await
            .map_err(|e| provision_error(image, format_error_chain(&e)))?;
        if exists {
            return Ok(());
        }

        let mut rx = self.join_or_start(image, source);
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map(|o| o.clone())
            .map_err(|_| provision_error(image, "provisioning task aborted".to_string()))?;

        match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(reason)) => Err(provision_error(image, reason)),
            None => Err(provision_error(image, "provisioning task aborted".to_string())),
        }
    }

    fn join_or_start(&self, image: &str, source: &ImageSource) -> watch::Receiver<Outcome> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(rx) = in_flight.get(image) {
            tracing::debug!(image, "joining in-flight image provisioning");
            return rx.clone();
        }

        let (tx, rx) = watch::channel(None);
        in_flight.insert(image.to_string(), rx.clone());
        drop(in_flight);

        let guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
            image: image.to_string(),
        };
        let runtime = self.runtime.clone();
        let image = image.to_string();
        let source = source.clone();
        let span = tracing::info_span!("provision_image", image = %image);

        // Owned by its own task so a cancelled caller never cancels the build.
        tokio::spawn(
            async move {
                let result = provision(runtime.as_ref(), &image, &source).await;
                match &result {
                    Ok(()) => tracing::info!("image ready"),
                    Err(e) => tracing::warn!(error = %format_error_chain(e), "image provisioning failed"),
                }
                // Release before publishing so a caller retrying after failure starts fresh.
                drop(guard);
                let _ = tx.send(Some(result.map_err(|e| format_error_chain(&e))));
            }
            .instrument(span),
        );
        rx
    }
}

async fn provision(
    runtime: &dyn ContainerRuntime,
    image: &str,
    source: &ImageSource,
) -> Result<(), RuntimeError> {
    if runtime.image_exists(image).await? {
        return Ok(());
    }
    match source {
        ImageSource::Build {
            dockerfile,
            context_dir,
        } => {
            let spec = BuildSpec {
                dockerfile: dockerfile.clone(),
                context_dir: context_dir.clone(),
            };
            runtime.build_image(image, &spec).await
        }
        ImageSource::Pull => {
            tracing::info!("pulling image");
            runtime.pull_image(image).await
        }
    }
}

fn provision_error(image: &str, reason: String) -> OrchestratorError {
    OrchestratorError::Provision {
        image: image.to_string(),
        reason,
    }
}
