//! Google Drive API v3 client wrapper.
//!
//! Token is passed per-call by the caller (TokenManager resolves it).

use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Base URLs of the Drive and OAuth endpoints. Overridable for tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveEndpoints {
    pub api_base: String,
    pub upload_base: String,
    /// `None` uses the token URI from the client secret.
    pub token_url: Option<String>,
}

impl Default for DriveEndpoints {
    fn default() -> Self {
        Self {
            api_base: "https://www.googleapis.com/drive/v3".to_string(),
            upload_base: "https://www.googleapis.com/upload/drive/v3".to_string(),
            token_url: None,
        }
    }
}

impl DriveEndpoints {
    /// Point every endpoint at one mock server.
    pub fn at(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            api_base: format!("{}/drive/v3", base),
            upload_base: format!("{}/upload/drive/v3", base),
            token_url: Some(format!("{}/token", base)),
        }
    }
}

/// File entry as returned by `files.list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub created_time: Option<String>,
}

impl DriveFile {
    /// Whether the browser can decode this entry.
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct CreatedFile {
    id: String,
}

/// Quote a value for a Drive search query.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

pub struct GDriveClient {
    http: Client,
    endpoints: DriveEndpoints,
}

impl GDriveClient {
    pub fn new(endpoints: DriveEndpoints) -> Self {
        Self {
            http: Client::new(),
            endpoints,
        }
    }

    /// Id of the first non-trashed root-level folder called `name`.
    #[instrument(skip(self, token), level = "debug")]
    pub async fn find_root_folder(&self, token: &str, name: &str) -> anyhow::Result<Option<String>> {
        let query = format!(
            "name = {} and mimeType = '{}' and 'root' in parents and trashed = false",
            quote(name),
            FOLDER_MIME_TYPE
        );
        let url = format!("{}/files", self.endpoints.api_base);

        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&[
                ("q", query.as_str()),
                ("spaces", "drive"),
                ("fields", "files(id,name)"),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Google Drive folder search error {}: {}", status, body);
        }

        let list: FileList = resp.json().await?;
        Ok(list.files.into_iter().next().map(|f| f.id))
    }

    /// Create a root-level folder and return its id.
    #[instrument(skip(self, token), level = "debug")]
    pub async fn create_root_folder(&self, token: &str, name: &str) -> anyhow::Result<String> {
        let url = format!("{}/files", self.endpoints.api_base);

        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .query(&[("fields", "id")])
            .json(&serde_json::json!({
                "name": name,
                "mimeType": FOLDER_MIME_TYPE,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Google Drive folder create error {}: {}", status, body);
        }

        let created: CreatedFile = resp.json().await?;
        debug!("Created folder {} ({})", name, created.id);
        Ok(created.id)
    }

    /// Upload a new file into `folder_id` as a metadata part plus a binary
    /// part. Returns the new file id.
    #[instrument(skip(self, token, data), level = "debug", fields(data_len = data.len()))]
    pub async fn upload_file(
        &self,
        token: &str,
        folder_id: &str,
        name: &str,
        mime_type: &str,
        data: Vec<u8>,
    ) -> anyhow::Result<String> {
        let url = format!("{}/files", self.endpoints.upload_base);
        let metadata = serde_json::json!({
            "name": name,
            "parents": [folder_id],
        });

        let form = Form::new()
            .part(
                "metadata",
                Part::text(metadata.to_string()).mime_str("application/json; charset=UTF-8")?,
            )
            .part(
                "file",
                Part::bytes(data).file_name(name.to_string()).mime_str(mime_type)?,
            );

        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .query(&[("uploadType", "multipart"), ("fields", "id")])
            .multipart(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Google Drive upload error {}: {}", status, body);
        }

        let created: CreatedFile = resp.json().await?;
        debug!("Uploaded {} as {}", name, created.id);
        Ok(created.id)
    }

    /// Image children of `folder_id`, oldest first. Follows paging.
    #[instrument(skip(self, token), level = "debug")]
    pub async fn list_folder(&self, token: &str, folder_id: &str) -> anyhow::Result<Vec<DriveFile>> {
        let query = format!("{} in parents and trashed = false", quote(folder_id));
        let url = format!("{}/files", self.endpoints.api_base);
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.http.get(&url).bearer_auth(token).query(&[
                ("q", query.as_str()),
                ("orderBy", "createdTime"),
                ("pageSize", "1000"),
                ("fields", "nextPageToken,files(id,name,mimeType,createdTime)"),
            ]);
            if let Some(pt) = &page_token {
                request = request.query(&[("pageToken", pt.as_str())]);
            }

            let resp = request.send().await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                anyhow::bail!("Google Drive list error {}: {}", status, body);
            }

            let page: FileList = resp.json().await?;
            files.extend(
                page.files
                    .into_iter()
                    .filter(DriveFile::is_image),
            );
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        debug!("Listed {} files in folder {}", files.len(), folder_id);
        Ok(files)
    }

    /// Download file content. `None` if the id does not exist.
    #[instrument(skip(self, token), level = "debug")]
    pub async fn download_file(&self, token: &str, file_id: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let url = format!("{}/files/{}", self.endpoints.api_base, file_id);

        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&[("alt", "media")])
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Google Drive download error {}: {}", status, body);
        }

        let bytes = resp.bytes().await?;
        debug!("Downloaded {} bytes for file {}", bytes.len(), file_id);
        Ok(Some(bytes.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("plain"), "'plain'");
        assert_eq!(quote("it's"), "'it\\'s'");
    }

    #[tokio::test]
    async fn test_find_root_folder() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(header("authorization", "Bearer tok"))
            .and(query_param(
                "q",
                "name = 'gallery' and mimeType = 'application/vnd.google-apps.folder' and 'root' in parents and trashed = false",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "files": [{"id": "F1", "name": "gallery"}]
            })))
            .mount(&server)
            .await;

        let client = GDriveClient::new(DriveEndpoints::at(&server.uri()));
        let id = client.find_root_folder("tok", "gallery").await.unwrap();
        assert_eq!(id.as_deref(), Some("F1"));
    }

    #[tokio::test]
    async fn test_upload_sends_metadata_and_file_parts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/drive/v3/files"))
            .and(query_param("uploadType", "multipart"))
            .and(body_string_contains("\"parents\":[\"F1\"]"))
            .and(body_string_contains("name=\"file\""))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "NEW"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = GDriveClient::new(DriveEndpoints::at(&server.uri()));
        let id = client
            .upload_file("tok", "F1", "00001-1.png", "image/png", vec![1, 2, 3])
            .await
            .unwrap();
        assert_eq!(id, "NEW");
    }

    #[tokio::test]
    async fn test_list_folder_follows_pages_and_keeps_only_images() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "files": [{"id": "c", "name": "c.png", "mimeType": "image/png"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(query_param("orderBy", "createdTime"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "nextPageToken": "p2",
                "files": [
                    {"id": "a", "name": "a.png", "mimeType": "image/png"},
                    {"id": "sub", "name": "sub", "mimeType": FOLDER_MIME_TYPE},
                    {"id": "notes", "name": "notes.txt", "mimeType": "text/plain"}
                ]
            })))
            .mount(&server)
            .await;

        let client = GDriveClient::new(DriveEndpoints::at(&server.uri()));
        let files = client.list_folder("tok", "F1").await.unwrap();
        let ids: Vec<_> = files.into_iter().map(|f| f.id).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_download_missing_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = GDriveClient::new(DriveEndpoints::at(&server.uri()));
        assert!(client.download_file("tok", "gone").await.unwrap().is_none());
    }
}
