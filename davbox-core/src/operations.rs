use std::hash::{Hash, Hasher};

use reqwest::header;
use tracing::debug;

use crate::client::{DavClient, DavMethod, DavRequest, DavResponse, TransportError};
use crate::result::{RemoteOperationResult, ResultPayload};
use crate::webdav::{parse_multistatus, propfind_body};

/// One remote action against a server. Descriptors are built by the
/// request layer, queued, and executed at most once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemoteOperation {
    Rename {
        path: String,
        new_name: String,
    },
    Remove {
        path: String,
        local_only: bool,
        is_last_of_batch: bool,
    },
    Move {
        src_path: String,
        dst_path: String,
        overwrite: bool,
    },
    Copy {
        src_path: String,
        dst_path: String,
        overwrite: bool,
    },
    ReadFolder {
        path: String,
    },
    CheckCredentials,
}

impl RemoteOperation {
    /// Stable identity used by queues and the undispatched-result
    /// cache. Two structurally equal operations share an id.
    pub fn id(&self) -> u64 {
        let mut hasher = std::hash::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    pub fn describe(&self) -> &'static str {
        match self {
            RemoteOperation::Rename { .. } => "rename",
            RemoteOperation::Remove { .. } => "remove",
            RemoteOperation::Move { .. } => "move",
            RemoteOperation::Copy { .. } => "copy",
            RemoteOperation::ReadFolder { .. } => "read-folder",
            RemoteOperation::CheckCredentials => "check-credentials",
        }
    }

    /// Runs the operation. Every failure mode is folded into the
    /// returned result; callers never see a transport error directly.
    pub async fn execute(&self, client: &DavClient) -> RemoteOperationResult {
        debug!(operation = self.describe(), "executing remote operation");
        match self.try_execute(client).await {
            Ok(result) => result,
            Err(error) => RemoteOperationResult::from_transport_error(&error),
        }
    }

    async fn try_execute(&self, client: &DavClient) -> Result<RemoteOperationResult, TransportError> {
        match self {
            RemoteOperation::Rename { path, new_name } => {
                let src = client.url_for_remote_path(path)?;
                let dst_path = format!("{}/{}", parent_path(path), new_name);
                let dst = client.url_for_remote_path(&dst_path)?;
                let response = client
                    .execute(
                        DavRequest::new(DavMethod::Move, src)
                            .destination(dst.to_string())
                            .overwrite(false),
                    )
                    .await?;
                Ok(result_from_response(&response))
            }
            RemoteOperation::Remove {
                path, local_only, ..
            } => {
                if *local_only {
                    // Storage-side removal only; nothing to tell the server.
                    return Ok(RemoteOperationResult::ok());
                }
                let url = client.url_for_remote_path(path)?;
                let response = client.execute(DavRequest::new(DavMethod::Delete, url)).await?;
                Ok(result_from_response(&response))
            }
            RemoteOperation::Move {
                src_path,
                dst_path,
                overwrite,
            } => {
                let src = client.url_for_remote_path(src_path)?;
                let dst = client.url_for_remote_path(dst_path)?;
                let response = client
                    .execute(
                        DavRequest::new(DavMethod::Move, src)
                            .destination(dst.to_string())
                            .overwrite(*overwrite),
                    )
                    .await?;
                Ok(result_from_response(&response))
            }
            RemoteOperation::Copy {
                src_path,
                dst_path,
                overwrite,
            } => {
                let src = client.url_for_remote_path(src_path)?;
                let dst = client.url_for_remote_path(dst_path)?;
                let response = client
                    .execute(
                        DavRequest::new(DavMethod::Copy, src)
                            .destination(dst.to_string())
                            .overwrite(*overwrite),
                    )
                    .await?;
                Ok(result_from_response(&response))
            }
            RemoteOperation::ReadFolder { path } => {
                let url = client.url_for_remote_path(path)?;
                let response = client
                    .execute(
                        DavRequest::new(DavMethod::Propfind, url)
                            .depth("1")
                            .body(propfind_body()),
                    )
                    .await?;
                let mut result = result_from_response(&response);
                if result.is_success() {
                    let files_root = client.user_files_url()?;
                    let root_path = files_root.path().trim_end_matches('/').to_string();
                    match parse_multistatus(&response.text(), &root_path) {
                        Ok(entries) => {
                            result = result.with_payload(ResultPayload::Entries(entries));
                        }
                        Err(error) => {
                            result = RemoteOperationResult::from_transport_error(&error);
                        }
                    }
                }
                Ok(result)
            }
            RemoteOperation::CheckCredentials => {
                let url = client.user_files_url()?;
                let response = client
                    .execute(
                        DavRequest::new(DavMethod::Propfind, url)
                            .depth("0")
                            .body(propfind_body()),
                    )
                    .await?;
                Ok(result_from_response(&response))
            }
        }
    }
}

fn result_from_response(response: &DavResponse) -> RemoteOperationResult {
    let mut result = RemoteOperationResult::from_http_status(response.status());
    if response.status().is_redirection()
        && let Some(location) = response.header(header::LOCATION.as_str())
    {
        result = result.with_redirected_location(location);
    }
    result
}

fn parent_path(path: &str) -> &str {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some((parent, _)) => parent,
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credentials;
    use crate::result::ResultCode;
    use url::Url;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn make_client(server: &MockServer) -> DavClient {
        let client =
            DavClient::new(Url::parse(&server.uri()).unwrap(), "davbox-test", false).unwrap();
        client.set_credentials(Credentials::basic("alice", "secret"));
        client
    }

    #[tokio::test]
    async fn rename_issues_a_move_within_the_parent() {
        let server = MockServer::start().await;
        let dst = format!("{}/remote.php/dav/files/alice/Docs/renamed.txt", server.uri());
        Mock::given(method("MOVE"))
            .and(path("/remote.php/dav/files/alice/Docs/old.txt"))
            .and(header("Destination", dst.as_str()))
            .and(header("Overwrite", "F"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server);
        let result = RemoteOperation::Rename {
            path: "/Docs/old.txt".into(),
            new_name: "renamed.txt".into(),
        }
        .execute(&client)
        .await;
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn local_only_remove_never_touches_the_server() {
        let server = MockServer::start().await;
        let client = make_client(&server);
        let result = RemoteOperation::Remove {
            path: "/Docs/old.txt".into(),
            local_only: true,
            is_last_of_batch: true,
        }
        .execute(&client)
        .await;
        assert!(result.is_success());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_folder_parses_the_listing_payload() {
        let server = MockServer::start().await;
        let body = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/remote.php/dav/files/alice/Docs/</d:href>
    <d:propstat><d:prop><d:resourcetype><d:collection/></d:resourcetype>
      <d:getetag>"e1"</d:getetag></d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>/remote.php/dav/files/alice/Docs/a.txt</d:href>
    <d:propstat><d:prop><d:resourcetype/>
      <d:getetag>"e2"</d:getetag>
      <d:getcontentlength>4</d:getcontentlength></d:prop></d:propstat>
  </d:response>
</d:multistatus>"#;
        Mock::given(method("PROPFIND"))
            .and(path("/remote.php/dav/files/alice/Docs"))
            .and(header("Depth", "1"))
            .respond_with(ResponseTemplate::new(207).set_body_string(body))
            .expect(1)
            .mount(&server)
            .await;

        let client = make_client(&server);
        let result = RemoteOperation::ReadFolder {
            path: "/Docs".into(),
        }
        .execute(&client)
        .await;
        assert!(result.is_success());
        let entries = result.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "/Docs");
        assert!(entries[0].is_dir);
        assert_eq!(entries[1].path, "/Docs/a.txt");
    }

    #[tokio::test]
    async fn missing_folder_maps_to_file_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("PROPFIND"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = make_client(&server);
        let result = RemoteOperation::ReadFolder {
            path: "/Gone".into(),
        }
        .execute(&client)
        .await;
        assert_eq!(result.code, ResultCode::FileNotFound);
        assert_eq!(result.http_status, Some(404));
    }

    #[tokio::test]
    async fn check_credentials_reports_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("PROPFIND"))
            .and(path("/remote.php/dav/files/alice/"))
            .and(header("Depth", "0"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = make_client(&server);
        let result = RemoteOperation::CheckCredentials.execute(&client).await;
        assert_eq!(result.code, ResultCode::Unauthorized);
    }

    #[test]
    fn structurally_equal_operations_share_an_id() {
        let a = RemoteOperation::ReadFolder { path: "/x".into() };
        let b = RemoteOperation::ReadFolder { path: "/x".into() };
        let c = RemoteOperation::ReadFolder { path: "/y".into() };
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn parent_path_strips_the_last_segment() {
        assert_eq!(parent_path("/Docs/old.txt"), "/Docs");
        assert_eq!(parent_path("/old.txt"), "");
        assert_eq!(parent_path("/Docs/sub/"), "/Docs");
    }
}
