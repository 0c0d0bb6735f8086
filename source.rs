//! Image acquisition from the camera or the photo gallery.

use crate::error::SourceError;
use crate::models::{ImageOrigin, RawImage};
use std::path::{Path, PathBuf};

// Formats the enabled `image` decoders can read.
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Undetermined,
    Granted,
    Denied,
}

/// Platform camera. `activate`/`deactivate` bracket every capture.
pub trait CameraDevice: Send {
    fn request_permission(&mut self) -> PermissionStatus;

    fn activate(&mut self) -> Result<(), String>;

    /// Takes one photo and returns its encoded bytes.
    fn capture(&mut self) -> Result<Vec<u8>, String>;

    fn deactivate(&mut self);
}

pub trait GalleryPicker: Send {
    /// Up to `limit` selected images; empty when the user picked nothing.
    fn pick(&mut self, limit: usize) -> Result<Vec<Vec<u8>>, String>;
}

pub struct ImageSource<C, G> {
    camera: C,
    gallery: G,
    permission: PermissionStatus,
}

impl<C: CameraDevice, G: GalleryPicker> ImageSource<C, G> {
    pub fn new(camera: C, gallery: G) -> Self {
        Self {
            camera,
            gallery,
            permission: PermissionStatus::Undetermined,
        }
    }

    pub fn camera_permission(&self) -> PermissionStatus {
        self.permission
    }

    /// Asks the platform once; later calls return the cached answer.
    pub fn request_camera_permission(&mut self) -> PermissionStatus {
        if self.permission == PermissionStatus::Undetermined {
            self.permission = self.camera.request_permission();
            log::info!("Camera permission: {:?}", self.permission);
        }
        self.permission
    }

    pub fn capture_from_camera(&mut self) -> Result<RawImage, SourceError> {
        if self.request_camera_permission() != PermissionStatus::Granted {
            return Err(SourceError::PermissionDenied);
        }
        let mut session = CameraSession::new(&mut self.camera);
        session.activate().map_err(SourceError::CaptureFailed)?;
        let bytes = session.capture().map_err(|err| {
            log::warn!("Failed to take picture: {err}");
            SourceError::CaptureFailed(err)
        })?;
        if bytes.is_empty() {
            return Err(SourceError::CaptureFailed("camera returned an empty frame".into()));
        }
        Ok(RawImage::encoded(bytes, ImageOrigin::Camera))
    }

    pub fn pick_from_gallery(&mut self) -> Result<RawImage, SourceError> {
        let mut picked = self.gallery.pick(1).map_err(|err| {
            log::warn!("Failed to select image from gallery: {err}");
            SourceError::ReadFailed(err)
        })?;
        if picked.is_empty() {
            return Err(SourceError::SelectionCancelled);
        }
        let bytes = picked.swap_remove(0);
        if bytes.is_empty() {
            return Err(SourceError::ReadFailed("selected image is empty".into()));
        }
        Ok(RawImage::encoded(bytes, ImageOrigin::Gallery))
    }

    pub fn camera_mut(&mut self) -> &mut C {
        &mut self.camera
    }

    pub fn gallery_mut(&mut self) -> &mut G {
        &mut self.gallery
    }
}

/// Keeps the camera active for its lifetime and releases it on drop.
struct CameraSession<'a, C: CameraDevice> {
    camera: &'a mut C,
}

impl<'a, C: CameraDevice> CameraSession<'a, C> {
    fn new(camera: &'a mut C) -> Self {
        Self { camera }
    }

    fn activate(&mut self) -> Result<(), String> {
        self.camera.activate()
    }

    fn capture(&mut self) -> Result<Vec<u8>, String> {
        self.camera.capture()
    }
}

impl<C: CameraDevice> Drop for CameraSession<'_, C> {
    fn drop(&mut self) {
        self.camera.deactivate();
        log::debug!("Camera session released");
    }
}

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Gallery backed by files on disk; the host sets the selection before `pick`.
#[derive(Debug, Default)]
pub struct FileGallery {
    selection: Vec<PathBuf>,
}

impl FileGallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&mut self, paths: impl IntoIterator<Item = PathBuf>) {
        self.selection = paths.into_iter().collect();
    }
}

impl GalleryPicker for FileGallery {
    fn pick(&mut self, limit: usize) -> Result<Vec<Vec<u8>>, String> {
        let chosen: Vec<PathBuf> = self.selection.drain(..).take(limit).collect();
        let mut images = Vec::with_capacity(chosen.len());
        for path in chosen {
            if !is_supported_image(&path) {
                return Err(format!("unsupported file type: {}", path.display()));
            }
            let bytes = std::fs::read(&path).map_err(|e| format!("{}: {e}", path.display()))?;
            images.push(bytes);
        }
        Ok(images)
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn capture_releases_camera_on_success() {
        let mut source = ImageSource::new(FakeCamera::granted(vec![1, 2, 3]), FakeGallery::default());
        let image = source.capture_from_camera().unwrap();
        assert_eq!(image.bytes(), &[1, 2, 3]);
        assert_eq!(image.origin(), ImageOrigin::Camera);
        let camera = source.camera_mut();
        assert_eq!((camera.activations, camera.deactivations), (1, 1));
    }

    #[test]
    fn capture_releases_camera_on_failure() {
        let mut camera = FakeCamera::granted(Vec::new());
        camera.frame = Err("sensor timeout".into());
        let mut source = ImageSource::new(camera, FakeGallery::default());
        assert_eq!(
            source.capture_from_camera().unwrap_err(),
            SourceError::CaptureFailed("sensor timeout".into())
        );
        assert_eq!(source.camera_mut().deactivations, 1);

        source.camera_mut().frame = Ok(Vec::new());
        assert!(matches!(
            source.capture_from_camera(),
            Err(SourceError::CaptureFailed(_))
        ));
        source.camera_mut().fail_activate = true;
        assert!(matches!(
            source.capture_from_camera(),
            Err(SourceError::CaptureFailed(msg)) if msg == "camera in use"
        ));
        let camera = source.camera_mut();
        assert_eq!((camera.activations, camera.deactivations), (3, 3));
    }

    #[test]
    fn denied_permission_fails_fast_without_hardware() {
        let mut camera = FakeCamera::granted(vec![9]);
        camera.permission = PermissionStatus::Denied;
        let mut source = ImageSource::new(camera, FakeGallery::default());
        assert_eq!(
            source.capture_from_camera().unwrap_err(),
            SourceError::PermissionDenied
        );
        assert_eq!(
            source.capture_from_camera().unwrap_err(),
            SourceError::PermissionDenied
        );
        let camera = source.camera_mut();
        assert_eq!(camera.activations, 0);
        assert_eq!(camera.permission_requests, 1);
    }

    #[test]
    fn gallery_outcomes() {
        let gallery = FakeGallery {
            picks: vec![
                Ok(vec![vec![7, 7]]),
                Err("permission revoked".into()),
                Ok(vec![Vec::new()]),
            ],
        };
        let mut source = ImageSource::new(FakeCamera::granted(vec![1]), gallery);
        let image = source.pick_from_gallery().unwrap();
        assert_eq!(image.origin(), ImageOrigin::Gallery);
        assert_eq!(image.bytes(), &[7, 7]);
        assert_eq!(
            source.pick_from_gallery().unwrap_err(),
            SourceError::ReadFailed("permission revoked".into())
        );
        assert!(matches!(
            source.pick_from_gallery(),
            Err(SourceError::ReadFailed(_))
        ));
        assert_eq!(
            source.pick_from_gallery().unwrap_err(),
            SourceError::SelectionCancelled
        );
        assert_eq!(SourceError::SelectionCancelled.user_message(), None);
    }

    #[test]
    fn file_gallery_reads_selected_file() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        let photo = dir.join("bottle.JPG");
        std::fs::write(&photo, b"jpeg-bytes").unwrap();

        let mut gallery = FileGallery::new();
        assert_eq!(gallery.pick(1).unwrap(), Vec::<Vec<u8>>::new());
        gallery.select(vec![photo.clone()]);
        assert_eq!(gallery.pick(1).unwrap(), vec![b"jpeg-bytes".to_vec()]);
        assert!(gallery.pick(1).unwrap().is_empty());

        gallery.select(vec![dir.join("missing.png")]);
        assert!(gallery.pick(1).is_err());
        gallery.select(vec![dir.join("notes.txt")]);
        assert!(gallery.pick(1).unwrap_err().contains("unsupported"));
    }

    #[test]
    fn only_decodable_formats_are_supported() {
        assert!(is_supported_image(Path::new("can.PNG")));
        assert!(is_supported_image(Path::new("bag.jpeg")));
        assert!(!is_supported_image(Path::new("bottle.heic")));
        assert!(!is_supported_image(Path::new("box.webp")));
        assert!(!is_supported_image(Path::new("README")));

        let temp_dir = TempDir::new().unwrap();
        let photo = temp_dir.path().join("IMG_0001.HEIC");
        std::fs::write(&photo, b"heic-bytes").unwrap();
        let mut gallery = FileGallery::new();
        gallery.select(vec![photo]);
        assert!(gallery.pick(1).unwrap_err().contains("unsupported"));
    }
}
