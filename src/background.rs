use image::RgbImage;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Background treatment applied behind the segmented subject.
///
/// Exactly one is active at a time; a new one applies from the next composited frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum BackgroundSpec {
    #[default]
    None,
    Blur(u32),
    StaticImage(ImageHandle),
    UploadedImage(ImageHandle),
}

impl BackgroundSpec {
    pub fn label(&self) -> String {
        match self {
            BackgroundSpec::None => "none".to_string(),
            BackgroundSpec::Blur(radius) => format!("blur({radius})"),
            BackgroundSpec::StaticImage(handle) => format!("static({})", handle.name()),
            BackgroundSpec::UploadedImage(handle) => format!("uploaded({})", handle.name()),
        }
    }
}

/// Shared handle to a background image that may still be loading.
///
/// The capture loop only ever peeks at it; loading happens elsewhere and the
/// image becomes visible to the next tick once published.
#[derive(Clone)]
pub struct ImageHandle {
    inner: Arc<ImageSlot>,
}

struct ImageSlot {
    name: String,
    image: watch::Sender<Option<Arc<RgbImage>>>,
    warned: AtomicBool,
}

impl ImageHandle {
    /// A handle whose image has not arrived yet.
    pub fn pending(name: impl Into<String>) -> Self {
        let (image, _) = watch::channel(None);
        Self {
            inner: Arc::new(ImageSlot {
                name: name.into(),
                image,
                warned: AtomicBool::new(false),
            }),
        }
    }

    pub fn ready(name: impl Into<String>, image: RgbImage) -> Self {
        let handle = Self::pending(name);
        handle.fulfil(image);
        handle
    }

    /// Decode `path` on the blocking pool; the handle fills in when decoding finishes.
    pub fn spawn_load(path: impl Into<PathBuf>) -> (Self, JoinHandle<Result<(), image::ImageError>>) {
        let path = path.into();
        let handle = Self::pending(path.display().to_string());
        let slot = handle.clone();
        let task = tokio::task::spawn_blocking(move || {
            tracing::debug!("Decoding background image {}", path.display());
            let image = image::open(&path).map_err(|err| {
                tracing::warn!("Failed to load background image {}: {}", path.display(), err);
                err
            })?;
            slot.fulfil(image.to_rgb8());
            tracing::info!("Background image {} loaded", path.display());
            Ok(())
        });
        (handle, task)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Non-blocking peek.
    pub fn get(&self) -> Option<Arc<RgbImage>> {
        self.inner.image.borrow().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.image.borrow().is_some()
    }

    pub fn fulfil(&self, image: RgbImage) {
        self.inner.image.send_replace(Some(Arc::new(image)));
    }

    /// Resolves once the image is available. Not for use inside a tick.
    pub async fn loaded(&self) -> Arc<RgbImage> {
        let mut rx = self.inner.image.subscribe();
        loop {
            if let Some(image) = rx.borrow_and_update().clone() {
                return image;
            }
            // The sender lives inside `inner`, so the channel cannot close while we hold it.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// True the first time it is called while the image is still missing.
    pub(crate) fn should_warn_pending(&self) -> bool {
        !self.inner.warned.swap(true, Ordering::Relaxed)
    }
}

impl PartialEq for ImageHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ImageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageHandle")
            .field("name", &self.inner.name)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
