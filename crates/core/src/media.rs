use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::SourceError;
use crate::model::{DataSource, MediaAttribution, MediaKind, MediaSizes};
use crate::providers::ContentIndexProvider;

#[derive(Clone)]
pub struct ContentIndexAdapter {
    source: DataSource<Arc<dyn ContentIndexProvider>>,
}

impl std::fmt::Debug for ContentIndexAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentIndexAdapter")
            .field("supported", &self.is_supported())
            .finish()
    }
}

impl ContentIndexAdapter {
    pub fn new(source: DataSource<Arc<dyn ContentIndexProvider>>) -> Self {
        Self { source }
    }

    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self {
            source: DataSource::Unavailable(reason.into()),
        }
    }

    pub fn is_supported(&self) -> bool {
        self.source
            .available()
            .is_some_and(|provider| provider.is_supported())
    }

    pub fn attribute_media(&self, key: &str, is_cancelled: &dyn Fn() -> bool) -> MediaAttribution {
        let Some(provider) = self.source.available().filter(|p| p.is_supported()) else {
            return MediaAttribution::default();
        };

        let mut sizes = MediaSizes::default();
        let mut failures = Vec::new();

        'kinds: for kind in MediaKind::ALL {
            if is_cancelled() {
                failures.push("content index lookup cancelled".to_string());
                break;
            }

            match provider.media_sizes(key, kind) {
                Ok(items) => {
                    let total = sizes.get_mut(kind);
                    for size in items {
                        if is_cancelled() {
                            failures.push("content index lookup cancelled".to_string());
                            break 'kinds;
                        }
                        *total = total.saturating_add(size);
                    }
                }
                Err(SourceError::PermissionDenied(reason)) => {
                    warn!(key, kind = kind.label(), "content index denied: {reason}");
                    failures.push(format!(
                        "content index permission denied for {}",
                        kind.label()
                    ));
                }
                Err(err) => {
                    warn!(key, kind = kind.label(), "content index query failed: {err}");
                    failures.push(format!(
                        "content index query for {} failed: {err}",
                        kind.label()
                    ));
                }
            }
        }

        debug!(key, total = sizes.total(), failures = failures.len(), "media attribution");
        MediaAttribution {
            sizes,
            accessible: failures.is_empty(),
            limitation: (!failures.is_empty()).then(|| failures.join("; ")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::ContentIndexAdapter;
    use crate::error::SourceError;
    use crate::model::{DataSource, MediaKind};
    use crate::providers::ContentIndexProvider;

    struct FixedIndex {
        deny: Option<MediaKind>,
        supported: bool,
        calls: AtomicUsize,
    }

    impl FixedIndex {
        fn new(deny: Option<MediaKind>, supported: bool) -> Arc<Self> {
            Arc::new(Self {
                deny,
                supported,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl ContentIndexProvider for FixedIndex {
        fn is_supported(&self) -> bool {
            self.supported
        }

        fn media_sizes(&self, _key: &str, kind: MediaKind) -> Result<Vec<u64>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.deny == Some(kind) {
                return Err(SourceError::PermissionDenied("READ_MEDIA".to_string()));
            }
            Ok(match kind {
                MediaKind::Images => vec![100, 50],
                MediaKind::Videos => vec![1_000],
                MediaKind::Audio => Vec::new(),
                MediaKind::Documents => vec![7],
            })
        }
    }

    #[test]
    fn sums_each_media_kind() {
        let index = FixedIndex::new(None, true);
        let adapter = ContentIndexAdapter::new(DataSource::Available(index.clone()));

        let attribution = adapter.attribute_media("com.example", &|| false);
        assert!(attribution.accessible);
        assert_eq!(attribution.sizes.images, 150);
        assert_eq!(attribution.sizes.videos, 1_000);
        assert_eq!(attribution.sizes.documents, 7);
        assert_eq!(attribution.limitation, None);
        assert_eq!(index.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn permission_failure_is_a_limitation_not_an_error() {
        let adapter =
            ContentIndexAdapter::new(DataSource::Available(FixedIndex::new(Some(MediaKind::Videos), true)));

        let attribution = adapter.attribute_media("com.example", &|| false);
        assert!(!attribution.accessible);
        assert_eq!(attribution.sizes.videos, 0);
        assert_eq!(attribution.sizes.images, 150);
        assert!(attribution
            .limitation
            .as_deref()
            .is_some_and(|text| text.contains("permission denied for videos")));
    }

    #[test]
    fn unsupported_index_is_never_queried() {
        let index = FixedIndex::new(None, false);
        let adapter = ContentIndexAdapter::new(DataSource::Available(index.clone()));
        assert!(!adapter.is_supported());

        let attribution = adapter.attribute_media("com.example", &|| false);
        assert_eq!(attribution.sizes.total(), 0);
        assert_eq!(index.calls.load(Ordering::SeqCst), 0);

        assert!(!ContentIndexAdapter::unsupported("api level too low").is_supported());
    }
}
