use async_trait::async_trait;
use std::panic::{catch_unwind, AssertUnwindSafe};
use rollcall_core::extractor::decode_image;
use rollcall_core::recognizer::ARCFACE_EMBEDDING_DIM;
use rollcall_core::{Embedding, EmbeddingExtractor, EngineState, ExtractError, FaceEngine};
use tokio::sync::{mpsc, oneshot, watch};

/// Inference backend owned by the engine thread.
pub trait Backend: Send + 'static {
    fn warm_up(&mut self) -> Result<(), ExtractError>;
    fn embed_all(&mut self, image: &image::RgbImage) -> Result<Vec<Embedding>, ExtractError>;
    fn embed_single(&mut self, image: &image::RgbImage) -> Result<Embedding, ExtractError>;
}

impl Backend for FaceEngine {
    fn warm_up(&mut self) -> Result<(), ExtractError> {
        FaceEngine::warm_up(self)
    }

    fn embed_all(&mut self, image: &image::RgbImage) -> Result<Vec<Embedding>, ExtractError> {
        FaceEngine::embed_all(self, image)
    }

    fn embed_single(&mut self, image: &image::RgbImage) -> Result<Embedding, ExtractError> {
        FaceEngine::embed_single(self, image)
    }
}

/// Messages sent from request handlers to the engine thread.
enum EngineRequest {
    ExtractMany {
        image: image::RgbImage,
        reply: oneshot::Sender<Result<Vec<Embedding>, ExtractError>>,
    },
    ExtractSingle {
        image: image::RgbImage,
        reply: oneshot::Sender<Result<Embedding, ExtractError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    state: watch::Receiver<EngineState>,
}

impl EngineHandle {
    pub fn state(&self) -> EngineState {
        self.state.borrow().clone()
    }

    /// Wait until the engine leaves warm-up. Errors if it failed to start.
    pub async fn wait_ready(&self) -> Result<(), ExtractError> {
        let mut state = self.state.clone();
        let settled = state
            .wait_for(|s| matches!(s, EngineState::Ready | EngineState::Failed(_)))
            .await
            .map(|s| (*s).clone())
            .unwrap_or_else(|_| self.state());

        match settled {
            EngineState::Ready => Ok(()),
            other => Err(ExtractError::NotReady(other)),
        }
    }

    fn ensure_ready(&self) -> Result<(), ExtractError> {
        match self.state() {
            EngineState::Ready => Ok(()),
            other => Err(ExtractError::NotReady(other)),
        }
    }

    /// Decode off the engine thread, then queue the inference.
    async fn submit<T>(
        &self,
        bytes: Vec<u8>,
        request: impl FnOnce(image::RgbImage, oneshot::Sender<Result<T, ExtractError>>) -> EngineRequest,
    ) -> Result<T, ExtractError> {
        self.ensure_ready()?;

        let image = tokio::task::spawn_blocking(move || decode_image(&bytes))
            .await
            .map_err(|e| ExtractError::Unavailable(format!("decode task: {e}")))??;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(request(image, reply_tx))
            .await
            .map_err(|_| ExtractError::Unavailable("engine thread exited".into()))?;
        reply_rx
            .await
            .map_err(|_| ExtractError::Unavailable("engine thread dropped the request".into()))?
    }
}

#[async_trait]
impl EmbeddingExtractor for EngineHandle {
    async fn extract_many(&self, image: Vec<u8>) -> Result<Vec<Embedding>, ExtractError> {
        self.submit(image, |image, reply| EngineRequest::ExtractMany { image, reply })
            .await
    }

    async fn extract_single(&self, image: Vec<u8>) -> Result<Embedding, ExtractError> {
        self.submit(image, |image, reply| EngineRequest::ExtractSingle { image, reply })
            .await
    }

    fn dimension(&self) -> Option<usize> {
        Some(ARCFACE_EMBEDDING_DIM)
    }
}

/// Run `f` and turn a panic into its message.
fn guarded<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        format!("inference panicked: {message}")
    })
}

/// Deliver a request's result. A panicked backend moves the engine to
/// `Failed` before the caller hears back; returns false when the loop must stop.
fn settle<T>(
    state_tx: &watch::Sender<EngineState>,
    reply: oneshot::Sender<Result<T, ExtractError>>,
    outcome: Result<Result<T, ExtractError>, String>,
) -> bool {
    match outcome {
        Ok(result) => {
            let _ = reply.send(result);
            true
        }
        Err(reason) => {
            tracing::error!(%reason, "engine backend panicked; refusing further requests");
            let failed = EngineState::Failed(reason);
            state_tx.send_replace(failed.clone());
            let _ = reply.send(Err(ExtractError::NotReady(failed)));
            false
        }
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Returns immediately with the engine in `Uninitialized`; the thread loads
/// the models, warms up and then serves requests one at a time. A load or
/// warm-up failure, or a panic while serving, leaves the state at `Failed`
/// and the thread exits.
pub fn spawn_engine<B, F>(load: F, queue: usize) -> std::io::Result<EngineHandle>
where
    B: Backend,
    F: FnOnce() -> Result<B, ExtractError> + Send + 'static,
{
    let (state_tx, state_rx) = watch::channel(EngineState::Uninitialized);
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(queue);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            state_tx.send_replace(EngineState::WarmingUp);
            tracing::info!("engine warming up");

            let started = guarded(|| {
                load().and_then(|mut backend| {
                    backend.warm_up()?;
                    Ok(backend)
                })
            });
            let mut backend = match started {
                Ok(Ok(backend)) => backend,
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "engine failed to start");
                    state_tx.send_replace(EngineState::Failed(e.to_string()));
                    return;
                }
                Err(reason) => {
                    tracing::error!(%reason, "engine failed to start");
                    state_tx.send_replace(EngineState::Failed(reason));
                    return;
                }
            };

            state_tx.send_replace(EngineState::Ready);
            tracing::info!("engine ready");

            while let Some(req) = rx.blocking_recv() {
                let serving = match req {
                    EngineRequest::ExtractMany { image, reply } => {
                        settle(&state_tx, reply, guarded(|| backend.embed_all(&image)))
                    }
                    EngineRequest::ExtractSingle { image, reply } => {
                        settle(&state_tx, reply, guarded(|| backend.embed_single(&image)))
                    }
                };
                if !serving {
                    break;
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, state: state_rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    /// Reports one "face" per 10 pixels of image width.
    struct StripeBackend;

    impl Backend for StripeBackend {
        fn warm_up(&mut self) -> Result<(), ExtractError> {
            Ok(())
        }

        fn embed_all(&mut self, image: &RgbImage) -> Result<Vec<Embedding>, ExtractError> {
            Ok((0..image.width() / 10).map(|i| Embedding::new(vec![i as f32])).collect())
        }

        fn embed_single(&mut self, image: &RgbImage) -> Result<Embedding, ExtractError> {
            rollcall_core::extractor::enforce_single(self.embed_all(image)?)
        }
    }

    fn png(width: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, 8, Rgb([1, 2, 3])))
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn test_ready_engine_serves_requests() {
        let engine = spawn_engine(|| Ok(StripeBackend), 2).unwrap();
        engine.wait_ready().await.unwrap();
        assert_eq!(engine.state(), EngineState::Ready);

        assert_eq!(engine.extract_many(png(30)).await.unwrap().len(), 3);
        assert!(engine.extract_many(png(5)).await.unwrap().is_empty());
        assert!(engine.extract_single(png(10)).await.is_ok());
        assert!(matches!(
            engine.extract_single(png(20)).await,
            Err(ExtractError::MultipleFacesDetected(2))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_upload_is_decode_error() {
        let engine = spawn_engine(|| Ok(StripeBackend), 2).unwrap();
        engine.wait_ready().await.unwrap();
        let err = engine.extract_many(b"GIF89a?".to_vec()).await.unwrap_err();
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn test_failed_load_fails_fast() {
        let engine = spawn_engine(
            || -> Result<StripeBackend, ExtractError> {
                Err(ExtractError::Unavailable("model file not found".into()))
            },
            2,
        )
        .unwrap();

        let err = engine.wait_ready().await.unwrap_err();
        assert!(matches!(err, ExtractError::NotReady(EngineState::Failed(_))));
        assert!(matches!(
            engine.extract_many(png(10)).await,
            Err(ExtractError::NotReady(EngineState::Failed(_)))
        ));
    }

    /// Panics on any photo wider than 10 pixels.
    struct BrittleBackend;

    impl Backend for BrittleBackend {
        fn warm_up(&mut self) -> Result<(), ExtractError> {
            Ok(())
        }

        fn embed_all(&mut self, image: &RgbImage) -> Result<Vec<Embedding>, ExtractError> {
            if image.width() > 10 {
                panic!("tensor shape mismatch");
            }
            Ok(Vec::new())
        }

        fn embed_single(&mut self, image: &RgbImage) -> Result<Embedding, ExtractError> {
            rollcall_core::extractor::enforce_single(self.embed_all(image)?)
        }
    }

    #[tokio::test]
    async fn test_backend_panic_fails_engine() {
        let engine = spawn_engine(|| Ok(BrittleBackend), 2).unwrap();
        engine.wait_ready().await.unwrap();
        assert!(engine.extract_many(png(5)).await.unwrap().is_empty());

        let err = engine.extract_many(png(30)).await.unwrap_err();
        assert!(matches!(&err, ExtractError::NotReady(EngineState::Failed(reason)) if reason.contains("tensor shape mismatch")));
        assert!(matches!(engine.state(), EngineState::Failed(_)));

        // Later requests fail fast instead of reaching a dead thread.
        assert!(matches!(
            engine.extract_single(png(5)).await,
            Err(ExtractError::NotReady(EngineState::Failed(_)))
        ));
    }

    #[tokio::test]
    async fn test_panic_during_load_fails_engine() {
        let engine = spawn_engine(
            || -> Result<StripeBackend, ExtractError> { panic!("corrupt model graph") },
            2,
        )
        .unwrap();
        let err = engine.wait_ready().await.unwrap_err();
        assert!(matches!(err, ExtractError::NotReady(EngineState::Failed(_))));
    }

    #[tokio::test]
    async fn test_requests_before_ready_are_rejected() {
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let engine = spawn_engine(
            move || {
                let _ = release_rx.recv();
                Ok(StripeBackend)
            },
            2,
        )
        .unwrap();

        let err = engine.extract_many(png(10)).await.unwrap_err();
        assert!(matches!(
            err,
            ExtractError::NotReady(EngineState::Uninitialized | EngineState::WarmingUp)
        ));

        release_tx.send(()).unwrap();
        engine.wait_ready().await.unwrap();
        assert_eq!(engine.extract_many(png(10)).await.unwrap().len(), 1);
    }
}
