use crate::archive;
use alfred_core::config::SourceConfig;
use alfred_core::{ComponentMetadata, Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const PER_PAGE: usize = 100;
const MAX_PAGES: usize = 20;

/// A repository as reported by the listing endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteRepository {
    pub name: String,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Remote origin of component repositories.
#[async_trait]
pub trait ComponentSource: Send + Sync {
    /// Identifier stored in the registry as `source_org`.
    fn org(&self) -> &str;

    async fn list_repositories(&self) -> Result<Vec<RemoteRepository>>;

    /// Parsed `metadata.json` from the root of the default branch.
    async fn fetch_metadata(&self, repo: &str) -> Result<ComponentMetadata>;

    /// Gzipped tarball of the repository. `version` selects a tag; `None`
    /// means the head of the default branch.
    async fn fetch_archive(&self, repo: &str, version: Option<&str>) -> Result<Vec<u8>>;
}

/// Builds the source described by `config`: a local mirror when
/// `localDir` is set, GitHub otherwise.
pub fn from_config(config: &SourceConfig) -> Result<Arc<dyn ComponentSource>> {
    match &config.local_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "Using local component mirror");
            Ok(Arc::new(LocalSource::new(dir.clone(), &config.org, &config.branch)))
        }
        None => Ok(Arc::new(GithubSource::new(config.clone())?)),
    }
}

/// GitHub compatible source.
pub struct GithubSource {
    client: Client,
    config: SourceConfig,
}

impl GithubSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("alfred/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Http(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn trim(base: &str) -> &str {
        base.trim_end_matches('/')
    }

    fn repos_url(&self, page: usize) -> String {
        format!(
            "{}/orgs/{}/repos?per_page={}&page={}",
            Self::trim(&self.config.api_base),
            self.config.org,
            PER_PAGE,
            page
        )
    }

    fn metadata_url(&self, repo: &str) -> String {
        format!(
            "{}/{}/{}/{}/metadata.json",
            Self::trim(&self.config.raw_base),
            self.config.org,
            repo,
            self.config.branch
        )
    }

    fn archive_url(&self, repo: &str, version: Option<&str>) -> String {
        let reference = match version {
            Some(tag) => format!("refs/tags/{}", tag),
            None => format!("refs/heads/{}", self.config.branch),
        };
        format!(
            "{}/{}/{}/archive/{}.tar.gz",
            Self::trim(&self.config.web_base),
            self.config.org,
            repo,
            reference
        )
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let mut request = self.client.get(url);
        if let Some(token) = self.config.token.as_deref().filter(|t| !t.is_empty()) {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("GET {} timed out", url))
                } else {
                    Error::Http(format!("GET {} failed: {}", url, e))
                }
            })?;

        if !response.status().is_success() {
            return Err(Error::Http(format!("GET {}: HTTP {}", url, response.status())));
        }
        Ok(response)
    }
}

#[async_trait]
impl ComponentSource for GithubSource {
    fn org(&self) -> &str {
        &self.config.org
    }

    async fn list_repositories(&self) -> Result<Vec<RemoteRepository>> {
        let mut repos = Vec::new();
        for page in 1..=MAX_PAGES {
            let url = self.repos_url(page);
            debug!(url = %url, "Listing repositories");
            let batch: Vec<RemoteRepository> = self
                .get(&url)
                .await?
                .json()
                .await
                .map_err(|e| Error::Http(format!("Invalid repository listing: {}", e)))?;
            let done = batch.len() < PER_PAGE;
            repos.extend(batch);
            if done {
                break;
            }
        }
        Ok(repos)
    }

    async fn fetch_metadata(&self, repo: &str) -> Result<ComponentMetadata> {
        let url = self.metadata_url(repo);
        let body = self
            .get(&url)
            .await?
            .text()
            .await
            .map_err(|e| Error::Http(format!("Failed to read {}: {}", url, e)))?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn fetch_archive(&self, repo: &str, version: Option<&str>) -> Result<Vec<u8>> {
        let url = self.archive_url(repo, version);
        debug!(url = %url, "Downloading archive");
        let bytes = self
            .get(&url)
            .await?
            .bytes()
            .await
            .map_err(|e| Error::Http(format!("Failed to read download: {}", e)))?;
        Ok(bytes.to_vec())
    }
}

/// Repositories checked out side by side in a directory, one per
/// `alfred-{kind}-{id}` folder.
pub struct LocalSource {
    root: PathBuf,
    org: String,
    branch: String,
}

impl LocalSource {
    pub fn new(root: PathBuf, org: &str, branch: &str) -> Self {
        Self {
            root,
            org: org.to_string(),
            branch: branch.to_string(),
        }
    }

    fn repo_dir(&self, repo: &str) -> Result<PathBuf> {
        let dir = self.root.join(repo);
        if !dir.is_dir() {
            return Err(Error::NotFound(format!("Repository {} not in {}", repo, self.root.display())));
        }
        Ok(dir)
    }
}

#[async_trait]
impl ComponentSource for LocalSource {
    fn org(&self) -> &str {
        &self.org
    }

    async fn list_repositories(&self) -> Result<Vec<RemoteRepository>> {
        let mut repos = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let updated_at = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339());
            repos.push(RemoteRepository {
                name: entry.file_name().to_string_lossy().to_string(),
                html_url: Some(format!("file://{}", entry.path().display())),
                updated_at,
            });
        }
        repos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(repos)
    }

    async fn fetch_metadata(&self, repo: &str) -> Result<ComponentMetadata> {
        let content = std::fs::read_to_string(self.repo_dir(repo)?.join("metadata.json"))?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn fetch_archive(&self, repo: &str, version: Option<&str>) -> Result<Vec<u8>> {
        let dir = self.repo_dir(repo)?;
        if let Some(wanted) = version {
            let meta = self.fetch_metadata(repo).await?;
            if meta.version != wanted {
                return Err(Error::NotFound(format!(
                    "{} has version {}, not {}",
                    repo, meta.version, wanted
                )));
            }
        }
        archive::pack_dir(&dir, &format!("{}-{}", repo, self.branch))
    }
}
