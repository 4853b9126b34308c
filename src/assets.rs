//! Promotion of session-local photos and logos to permanent URLs.
//!
//! Upload failures are per asset: a photo that cannot be uploaded stays in
//! the list unchanged and the save carries on with whatever succeeded. A
//! `blob:` logo URL is never handed back for persistence.

use std::sync::Arc;

use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::{AssetFile, HeaderSettings, Photo};

/// URLs returned by the asset service for one uploaded file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedAsset {
    pub url: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub medium_url: Option<String>,
    #[serde(default)]
    pub large_url: Option<String>,
    pub public_id: String,
}

/// External upload service (Cloudinary in production).
pub trait AssetUploadService: Send + Sync {
    fn upload<'a>(&'a self, file: &'a AssetFile) -> BoxFuture<'a, Result<UploadedAsset>>;
}

/// Persistable logo reference after upload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogoUpload {
    pub url: Option<String>,
    pub public_id: Option<String>,
}

impl LogoUpload {
    /// Write the result into `header`, dropping the local binaries.
    pub fn apply_to(&self, header: &mut HeaderSettings) {
        header.logo_url = self.url.clone();
        header.logo_public_id = self.public_id.clone();
        header.clear_local_logo();
    }
}

/// Uploads pending assets through an [`AssetUploadService`].
#[derive(Clone)]
pub struct AssetUploader {
    service: Arc<dyn AssetUploadService>,
}

impl AssetUploader {
    pub fn new(service: Arc<dyn AssetUploadService>) -> Self {
        Self { service }
    }

    /// Number of photos still waiting for an upload.
    pub fn pending_photo_count(photos: &[Photo]) -> usize {
        photos.iter().filter(|p| p.is_local).count()
    }

    /// Upload every local photo and rewrite its entry with permanent URLs.
    pub async fn upload_pending_photos(&self, photos: Vec<Photo>) -> Vec<Photo> {
        let pending = Self::pending_photo_count(&photos);
        if pending == 0 {
            return photos;
        }
        info!("[AssetUploader] Uploading {} local photos", pending);

        let mut uploaded = 0;
        let mut result = Vec::with_capacity(photos.len());

        for photo in photos {
            if !photo.is_local {
                result.push(photo);
                continue;
            }

            let Some(file) = photo.upload_source() else {
                warn!(
                    "[AssetUploader] Photo {} has no file to upload, keeping it local",
                    photo.id
                );
                result.push(photo);
                continue;
            };

            match self.service.upload(file).await {
                Ok(asset) => {
                    debug!("[AssetUploader] Uploaded photo {} as {}", photo.id, asset.public_id);
                    uploaded += 1;
                    result.push(Photo {
                        url: asset.url,
                        thumbnail_url: asset.thumbnail_url,
                        medium_url: asset.medium_url,
                        large_url: asset.large_url,
                        public_id: Some(asset.public_id),
                        is_local: false,
                        original_file: None,
                        blobs: None,
                        ..photo
                    });
                }
                Err(e) => {
                    error!("[AssetUploader] Failed to upload photo {}: {}", photo.id, e);
                    result.push(photo);
                }
            }
        }

        info!("[AssetUploader] Uploaded {}/{} photos", uploaded, pending);
        result
    }

    /// Resolve the logo reference to persist for `header`.
    pub async fn upload_logo(&self, header: &HeaderSettings) -> LogoUpload {
        let local_url = header.has_local_logo_url();
        let existing = LogoUpload {
            url: header.logo_url.clone(),
            public_id: header.logo_public_id.clone(),
        };

        let Some(file) = header.logo_source() else {
            if local_url {
                warn!("[AssetUploader] Logo URL is session-local and no file is available, clearing it");
                return LogoUpload::default();
            }
            return existing;
        };

        match self.service.upload(file).await {
            Ok(asset) => {
                info!("[AssetUploader] Uploaded logo as {}", asset.public_id);
                LogoUpload {
                    url: Some(asset.url),
                    public_id: Some(asset.public_id),
                }
            }
            Err(e) => {
                error!("[AssetUploader] Failed to upload logo: {}", e);
                if local_url {
                    LogoUpload::default()
                } else {
                    existing
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoordinatorError;
    use crate::{AssetBlobs, LogoData};
    use std::sync::Mutex;

    /// Records uploaded file names; fails for names starting with "bad".
    #[derive(Default)]
    struct RecordingUploader {
        uploads: Mutex<Vec<String>>,
    }

    impl AssetUploadService for RecordingUploader {
        fn upload<'a>(&'a self, file: &'a AssetFile) -> BoxFuture<'a, Result<UploadedAsset>> {
            Box::pin(async move {
                self.uploads.lock().unwrap().push(file.name.clone());
                if file.name.starts_with("bad") {
                    return Err(CoordinatorError::Upload {
                        asset_id: file.name.clone(),
                        message: "rejected".to_string(),
                    });
                }
                Ok(UploadedAsset {
                    url: format!("https://cdn.example/{}", file.name),
                    thumbnail_url: Some(format!("https://cdn.example/t/{}", file.name)),
                    medium_url: Some(format!("https://cdn.example/m/{}", file.name)),
                    large_url: Some(format!("https://cdn.example/l/{}", file.name)),
                    public_id: format!("photos/{}", file.name),
                })
            })
        }
    }

    fn file(name: &str) -> AssetFile {
        AssetFile::new(name, "image/jpeg", vec![0xff, 0xd8])
    }

    #[tokio::test]
    async fn test_local_photos_are_promoted() {
        let service = Arc::new(RecordingUploader::default());
        let uploader = AssetUploader::new(service.clone());

        let remote = Photo {
            id: "remote".to_string(),
            url: "https://cdn.example/remote.jpg".to_string(),
            ..Photo::default()
        };
        let local = Photo::local("local", "blob:http://localhost/1", file("a.jpg"));

        let photos = uploader.upload_pending_photos(vec![remote.clone(), local]).await;

        assert_eq!(service.uploads.lock().unwrap().as_slice(), ["a.jpg"]);
        assert_eq!(photos[0], remote);
        assert!(!photos[1].is_local);
        assert_eq!(photos[1].url, "https://cdn.example/a.jpg");
        assert_eq!(photos[1].public_id.as_deref(), Some("photos/a.jpg"));
        assert!(photos[1].original_file.is_none());
        assert!(photos[1].large_url.is_some());
    }

    #[tokio::test]
    async fn test_large_blob_is_fallback_source() {
        let service = Arc::new(RecordingUploader::default());
        let uploader = AssetUploader::new(service.clone());

        let photo = Photo {
            id: "p".to_string(),
            url: "blob:http://localhost/2".to_string(),
            is_local: true,
            blobs: Some(AssetBlobs {
                original: None,
                large: Some(file("large.jpg")),
            }),
            ..Photo::default()
        };
        let photos = uploader.upload_pending_photos(vec![photo]).await;
        assert!(!photos[0].is_local);
        assert_eq!(service.uploads.lock().unwrap().as_slice(), ["large.jpg"]);
    }

    #[tokio::test]
    async fn test_failures_and_missing_files_keep_photo_local() {
        let service = Arc::new(RecordingUploader::default());
        let uploader = AssetUploader::new(service.clone());

        let no_file = Photo {
            id: "nofile".to_string(),
            url: "blob:http://localhost/3".to_string(),
            is_local: true,
            ..Photo::default()
        };
        let failing = Photo::local("failing", "blob:http://localhost/4", file("bad.jpg"));
        let good = Photo::local("good", "blob:http://localhost/5", file("good.jpg"));

        let photos = uploader
            .upload_pending_photos(vec![no_file, failing, good])
            .await;

        assert_eq!(photos.len(), 3);
        assert!(photos[0].is_local);
        assert!(photos[1].is_local);
        assert!(photos[1].original_file.is_some());
        assert!(!photos[2].is_local);
        assert_eq!(AssetUploader::pending_photo_count(&photos), 2);
    }

    #[tokio::test]
    async fn test_blob_logo_without_file_is_nulled() {
        let uploader = AssetUploader::new(Arc::new(RecordingUploader::default()));
        let header = HeaderSettings {
            logo_url: Some("blob:http://localhost/logo".to_string()),
            logo_public_id: Some("stale".to_string()),
            ..HeaderSettings::default()
        };

        let result = uploader.upload_logo(&header).await;
        assert_eq!(result, LogoUpload { url: None, public_id: None });
    }

    #[tokio::test]
    async fn test_remote_logo_is_kept() {
        let service = Arc::new(RecordingUploader::default());
        let uploader = AssetUploader::new(service.clone());
        let header = HeaderSettings {
            logo_url: Some("https://cdn.example/logo.png".to_string()),
            logo_public_id: Some("logos/logo".to_string()),
            ..HeaderSettings::default()
        };

        let result = uploader.upload_logo(&header).await;
        assert_eq!(result.url.as_deref(), Some("https://cdn.example/logo.png"));
        assert_eq!(result.public_id.as_deref(), Some("logos/logo"));
        assert!(service.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_logo_upload_uses_priority_source() {
        let service = Arc::new(RecordingUploader::default());
        let uploader = AssetUploader::new(service.clone());
        let mut header = HeaderSettings {
            logo_url: Some("blob:http://localhost/logo".to_string()),
            logo_file: Some(file("flat.png")),
            logo_data: Some(LogoData {
                file: Some(file("nested.png")),
                blobs: None,
            }),
            ..HeaderSettings::default()
        };

        let result = uploader.upload_logo(&header).await;
        assert_eq!(service.uploads.lock().unwrap().as_slice(), ["nested.png"]);
        assert_eq!(result.url.as_deref(), Some("https://cdn.example/nested.png"));

        result.apply_to(&mut header);
        assert!(!header.has_pending_logo());
        assert_eq!(header.logo_public_id.as_deref(), Some("photos/nested.png"));
    }

    #[tokio::test]
    async fn test_failed_logo_upload_never_returns_blob_url() {
        let uploader = AssetUploader::new(Arc::new(RecordingUploader::default()));
        let header = HeaderSettings {
            logo_url: Some("blob:http://localhost/logo".to_string()),
            logo_blob: Some(file("bad-logo.png")),
            ..HeaderSettings::default()
        };

        let result = uploader.upload_logo(&header).await;
        assert_eq!(result, LogoUpload::default());
    }
}
