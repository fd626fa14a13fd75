//! The remote service HTTP collaborator. Built on `reqwest::blocking`:
//! one call per remote operation, Bearer auth, `links.next`-style
//! pagination.

use std::io::Read;
use std::path::Path;

use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::StatusCode;
use serde_derive::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::types::{ContentKind, FileId, NodeId, RevisionId, Sha256};

/// A remote storage object as returned by the listing endpoints, folded
/// down to what the Auditor and Operations need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub id: FileId,
    pub name: String,
    pub kind: ContentKind,
    pub parent: Option<FileId>,
    pub sha256: Option<Sha256>,
    pub node_id: NodeId,
    pub current_revision_id: RevisionId,
}

#[derive(Debug, Deserialize)]
struct Links {
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChildAttributes {
    name: String,
    kind: String,
    #[serde(default)]
    extra: Option<ExtraHashes>,
}

#[derive(Debug, Deserialize)]
struct ExtraHashes {
    hashes: Option<Hashes>,
}

#[derive(Debug, Deserialize)]
struct Hashes {
    sha256: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChildResource {
    id: String,
    attributes: ChildAttributes,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    data: Vec<ChildResource>,
    links: Links,
}

#[derive(Serialize)]
struct MoveRequestSource {
    path: String,
    provider: String,
    nid: String,
}

#[derive(Serialize)]
struct MoveRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    rename: Option<String>,
    conflict: String,
    source: MoveRequestSource,
    destination: MoveRequestSource,
}

/// Thin Bearer-auth wrapper over the remote project-hosting service.
pub struct Client {
    http: HttpClient,
    base_url: String,
    token: String,
}

impl Client {
    pub fn new(base_url: String, token: String) -> Result<Self, ClientError> {
        let http = HttpClient::builder()
            .build()
            .map_err(ClientError::from)?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    fn check_status(response: Response) -> Result<Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let status_code = status.as_u16();
        let body = response.text().unwrap_or_default();
        Err(ClientError::BadRequest(status_code, body))
    }

    /// Lists every child of `folder_id` (or the storage root when `None`),
    /// following `links.next` until it's null.
    pub fn list_children(
        &self,
        node_id: &NodeId,
        folder_id: Option<&FileId>,
    ) -> Result<Vec<RemoteEntry>, ClientError> {
        let mut url = match folder_id {
            Some(fid) => format!("{}/nodes/{}/files/{}/children", self.base_url, node_id, fid),
            None => format!("{}/nodes/{}/files", self.base_url, node_id),
        };

        let mut entries = Vec::new();
        loop {
            let response = self
                .http
                .get(&url)
                .bearer_auth(&self.token)
                .send()?;
            let response = Self::check_status(response)?;
            let parsed: ListResponse = response.json().map_err(ClientError::from)?;

            for child in parsed.data {
                let kind = if child.attributes.kind == "folder" {
                    ContentKind::Folder
                } else {
                    ContentKind::File
                };
                let sha256 = child
                    .attributes
                    .extra
                    .and_then(|e| e.hashes)
                    .and_then(|h| h.sha256);
                entries.push(RemoteEntry {
                    id: FileId(child.id),
                    name: child.attributes.name,
                    kind,
                    parent: folder_id.cloned(),
                    sha256,
                    node_id: node_id.clone(),
                    current_revision_id: RevisionId::default(),
                });
            }

            match parsed.links.next {
                Some(next) => url = next,
                None => break,
            }
        }

        Ok(entries)
    }

    pub fn get_file_content(&self, node_id: &NodeId, file_id: &FileId) -> Result<Response, ClientError> {
        let url = format!("{}/nodes/{}/files/{}/content", self.base_url, node_id, file_id);
        let response = self.http.get(&url).bearer_auth(&self.token).send()?;
        Self::check_status(response)
    }

    /// `PUT` upload with `path, provider, nid` query parameters.
    pub fn upload(
        &self,
        node_id: &NodeId,
        provider: &str,
        path: &str,
        local_path: &Path,
    ) -> Result<(FileId, RevisionId), ClientError> {
        let bytes = std::fs::read(local_path)
            .map_err(|_| ClientError::InputFileError(local_path.to_string_lossy().into_owned()))?;
        let url = format!("{}/files", self.base_url);
        let response = self
            .http
            .put(&url)
            .bearer_auth(&self.token)
            .query(&[("path", path), ("provider", provider), ("nid", node_id.0.as_str())])
            .body(bytes)
            .send()?;
        let response = Self::check_status(response)?;
        let parsed: UploadResponse = response.json().map_err(ClientError::from)?;
        Ok((FileId(parsed.id), RevisionId::from(parsed.revision)))
    }

    /// `POST` with no body, `path, provider, nid` query parameters.
    pub fn create_folder(
        &self,
        node_id: &NodeId,
        provider: &str,
        path: &str,
    ) -> Result<FileId, ClientError> {
        let url = format!("{}/files", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .query(&[("path", path), ("provider", provider), ("nid", node_id.0.as_str())])
            .send()?;
        if response.status() == StatusCode::CONFLICT {
            return Err(ClientError::AlreadyExistResponse(
                FileId(String::new()),
                RevisionId::default(),
            ));
        }
        let response = Self::check_status(response)?;
        let parsed: UploadResponse = response.json().map_err(ClientError::from)?;
        Ok(FileId(parsed.id))
    }

    pub fn move_or_copy(
        &self,
        provider: &str,
        source_nid: &NodeId,
        source_path: &str,
        destination_nid: &NodeId,
        destination_path: &str,
        rename: Option<String>,
    ) -> Result<(), ClientError> {
        let url = format!("{}/move", self.base_url);
        let body = MoveRequest {
            rename,
            conflict: "replace".to_string(),
            source: MoveRequestSource {
                path: source_path.to_string(),
                provider: provider.to_string(),
                nid: source_nid.0.clone(),
            },
            destination: MoveRequestSource {
                path: destination_path.to_string(),
                provider: provider.to_string(),
                nid: destination_nid.0.clone(),
            },
        };
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()?;
        Self::check_status(response)?;
        Ok(())
    }

    pub fn trash(&self, node_id: &NodeId, file_id: &FileId) -> Result<(), ClientError> {
        let url = format!("{}/nodes/{}/files/{}", self.base_url, node_id, file_id);
        let response = self.http.delete(&url).bearer_auth(&self.token).send()?;
        Self::check_status(response)?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: String,
    #[serde(default)]
    revision: String,
}

/// Drains a remote download response straight to a local file.
pub fn copy_to_file(mut response: impl Read, out_path: &Path) -> std::io::Result<()> {
    let mut out = std::fs::File::create(out_path)?;
    std::io::copy(&mut response, &mut out)?;
    Ok(())
}
