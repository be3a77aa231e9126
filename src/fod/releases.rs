use std::path::Path;

use crate::{
    error::{Error, Result},
    fod::{
        connection::{ApiGroup, Connection},
        download::DownloadCoordinator,
        query::{QueryBuilder, typed_query_builder},
    },
    json::JsonMap,
    types::{ArtifactKind, DownloadTask},
};

typed_query_builder!(
    /// Query over `/releases`.
    ReleasesQueryBuilder
);

impl ReleasesQueryBuilder {
    pub fn application_name(self, name: &str) -> Self {
        self.filter("applicationName", name)
    }

    pub fn release_name(self, name: &str) -> Self {
        self.filter("releaseName", name)
    }

    pub fn release_id(self, id: &str) -> Self {
        self.filter("releaseId", id)
    }

    pub fn sdlc_status(self, status: &str) -> Self {
        self.filter("sdlcStatusType", status)
    }
}

/// Releases and their FPR artifacts.
#[derive(Clone)]
pub struct ReleaseApi {
    conn: Connection,
}

impl ApiGroup for ReleaseApi {
    fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }
}

impl ReleaseApi {
    pub fn query_releases(&self) -> ReleasesQueryBuilder {
        QueryBuilder::new(self.conn.clone(), "releases").into()
    }

    /// Looks up a release by numeric id or by `application:release` name.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] when `name_or_id` is neither a number nor of
    /// the form `application:release`; [`Error::MultipleResults`] when the
    /// name is ambiguous.
    pub async fn get_release_by_name_or_id(
        &self,
        name_or_id: &str,
        use_cache: bool,
    ) -> Result<Option<JsonMap>> {
        let query = if !name_or_id.is_empty() && name_or_id.chars().all(|c| c.is_ascii_digit()) {
            self.query_releases().release_id(name_or_id)
        } else {
            let (application, release) = name_or_id.split_once(':').ok_or_else(|| {
                Error::Configuration(format!(
                    "'{name_or_id}' is neither a release id nor of the form application:release"
                ))
            })?;
            self.query_releases()
                .application_name(application)
                .release_name(release)
        };

        match query.use_cache(use_cache).build().get_unique().await {
            Ok(release) => Ok(Some(release)),
            Err(Error::NotUnique) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Saves the FPR of `release_id` for the given scan type at `destination`.
    ///
    /// # Errors
    ///
    /// [`Error::Download`] describing the failed target; `destination` is
    /// left untouched.
    pub async fn save_fpr(
        &self,
        release_id: &str,
        kind: ArtifactKind,
        destination: &Path,
    ) -> Result<u64> {
        let task = DownloadTask::new(release_id, kind, destination.to_path_buf());
        DownloadCoordinator::new(self.conn.clone())
            .download(&task)
            .await
    }
}

/// `releaseId` of a release document, whether sent as number or string.
pub fn release_id(release: &JsonMap) -> Option<String> {
    release.get_string_lossy("releaseId")
}
