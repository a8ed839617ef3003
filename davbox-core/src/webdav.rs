use std::time::UNIX_EPOCH;

use percent_encoding::percent_decode_str;
use quick_xml::Reader;
use quick_xml::events::Event;
use thiserror::Error;

pub const WEBDAV_FILES_PATH: &str = "/remote.php/dav/files/";

#[derive(Debug, Error)]
pub enum WebdavError {
    #[error("xml parse error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("multistatus response has no entries")]
    EmptyMultistatus,
}

/// One resource from a PROPFIND listing. `path` is relative to the
/// user files root, decoded, without a trailing slash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub path: String,
    pub name: String,
    pub is_dir: bool,
    pub etag: Option<String>,
    pub remote_id: Option<String>,
    pub modified: Option<i64>,
    pub size: Option<u64>,
    pub permissions: Option<String>,
}

pub fn user_files_path(user_id: &str) -> String {
    if user_id.is_empty() {
        WEBDAV_FILES_PATH.to_string()
    } else {
        format!("{WEBDAV_FILES_PATH}{user_id}/")
    }
}

/// Depth-aware PROPFIND body requesting the properties the sync engine
/// consumes.
pub fn propfind_body() -> &'static str {
    r#"<?xml version="1.0" encoding="utf-8" ?>
<d:propfind xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
  <d:prop>
    <d:resourcetype/>
    <d:getetag/>
    <d:getlastmodified/>
    <d:getcontentlength/>
    <oc:id/>
    <oc:permissions/>
  </d:prop>
</d:propfind>"#
}

/// Parses a `d:multistatus` body into entries. `files_root` is the
/// path prefix of the account's WebDAV root (no trailing slash
/// required); hrefs outside it are kept with their full decoded path.
/// The first entry of a Depth-1 listing is the queried folder itself.
pub fn parse_multistatus(xml: &str, files_root: &str) -> Result<Vec<RemoteEntry>, WebdavError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<EntryBuilder> = None;
    let mut element_stack: Vec<String> = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = local_name(e.name().as_ref());
                if name == "response" {
                    current = Some(EntryBuilder::default());
                }
                element_stack.push(name);
            }
            Event::Empty(e) => {
                let name = local_name(e.name().as_ref());
                if name == "collection"
                    && element_stack.last().is_some_and(|top| top == "resourcetype")
                    && let Some(entry) = current.as_mut()
                {
                    entry.is_dir = true;
                }
            }
            Event::Text(t) => {
                let text = t.unescape().unwrap_or_default().trim().to_string();
                if text.is_empty() {
                    continue;
                }
                let Some(entry) = current.as_mut() else {
                    continue;
                };
                match element_stack.last().map(String::as_str) {
                    Some("href") => entry.href = Some(text),
                    Some("getetag") => entry.etag = Some(normalize_etag(&text)),
                    Some("getlastmodified") => {
                        entry.modified = httpdate::parse_http_date(&text)
                            .ok()
                            .and_then(|when| when.duration_since(UNIX_EPOCH).ok())
                            .map(|elapsed| elapsed.as_secs() as i64);
                    }
                    Some("getcontentlength") => entry.size = text.parse().ok(),
                    Some("id") => entry.remote_id = Some(text),
                    Some("permissions") => entry.permissions = Some(text),
                    _ => {}
                }
            }
            Event::End(e) => {
                let name = local_name(e.name().as_ref());
                element_stack.pop();
                if name == "response"
                    && let Some(builder) = current.take()
                    && let Some(entry) = builder.finish(files_root)
                {
                    entries.push(entry);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if entries.is_empty() {
        return Err(WebdavError::EmptyMultistatus);
    }
    Ok(entries)
}

fn local_name(qualified: &[u8]) -> String {
    let qualified = String::from_utf8_lossy(qualified);
    match qualified.rsplit_once(':') {
        Some((_, local)) => local.to_ascii_lowercase(),
        None => qualified.to_ascii_lowercase(),
    }
}

fn normalize_etag(raw: &str) -> String {
    raw.trim_start_matches("W/").trim_matches('"').to_string()
}

#[derive(Default)]
struct EntryBuilder {
    href: Option<String>,
    is_dir: bool,
    etag: Option<String>,
    remote_id: Option<String>,
    modified: Option<i64>,
    size: Option<u64>,
    permissions: Option<String>,
}

impl EntryBuilder {
    fn finish(self, files_root: &str) -> Option<RemoteEntry> {
        let href = self.href?;
        let decoded = percent_decode_str(&href).decode_utf8_lossy().into_owned();
        let mut path = match decoded.find(files_root) {
            Some(idx) => decoded[idx + files_root.len()..].to_string(),
            None => decoded,
        };
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        if path.len() > 1 && path.ends_with('/') {
            path.pop();
        }
        let name = match path.rsplit_once('/') {
            Some((_, name)) if !name.is_empty() => name.to_string(),
            _ => "/".to_string(),
        };
        Some(RemoteEntry {
            path,
            name,
            is_dir: self.is_dir,
            etag: self.etag,
            remote_id: self.remote_id,
            modified: self.modified,
            size: self.size,
            permissions: self.permissions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
  <d:response>
    <d:href>/remote.php/dav/files/alice/Photos/</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype><d:collection/></d:resourcetype>
        <d:getetag>"5ef3a2b1"</d:getetag>
        <oc:id>00000101oc</oc:id>
        <oc:permissions>RDNVCK</oc:permissions>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/remote.php/dav/files/alice/Photos/summer%20trip.jpg</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype/>
        <d:getetag>W/"77aa01"</d:getetag>
        <d:getlastmodified>Wed, 01 Jan 2025 00:00:00 GMT</d:getlastmodified>
        <d:getcontentlength>52946</d:getcontentlength>
        <oc:id>00000102oc</oc:id>
        <oc:permissions>RDNVW</oc:permissions>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>"#;

    #[test]
    fn depth_one_listing_starts_with_the_folder_itself() {
        let entries = parse_multistatus(LISTING, "/remote.php/dav/files/alice").unwrap();
        assert_eq!(entries.len(), 2);

        let folder = &entries[0];
        assert_eq!(folder.path, "/Photos");
        assert_eq!(folder.name, "Photos");
        assert!(folder.is_dir);
        assert_eq!(folder.etag.as_deref(), Some("5ef3a2b1"));

        let file = &entries[1];
        assert_eq!(file.path, "/Photos/summer trip.jpg");
        assert_eq!(file.name, "summer trip.jpg");
        assert!(!file.is_dir);
        assert_eq!(file.etag.as_deref(), Some("77aa01"));
        assert_eq!(file.size, Some(52946));
        assert_eq!(file.modified, Some(1735689600));
        assert_eq!(file.remote_id.as_deref(), Some("00000102oc"));
    }

    #[test]
    fn weak_and_quoted_etags_are_normalized() {
        assert_eq!(normalize_etag("\"abc\""), "abc");
        assert_eq!(normalize_etag("W/\"abc\""), "abc");
        assert_eq!(normalize_etag("abc"), "abc");
    }

    #[test]
    fn empty_multistatus_is_an_error() {
        let xml = r#"<d:multistatus xmlns:d="DAV:"></d:multistatus>"#;
        assert!(matches!(
            parse_multistatus(xml, "/remote.php/dav/files/alice"),
            Err(WebdavError::EmptyMultistatus)
        ));
    }

    #[test]
    fn root_listing_maps_to_the_root_path() {
        let xml = r#"<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/remote.php/dav/files/alice/</d:href>
    <d:propstat><d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop></d:propstat>
  </d:response>
</d:multistatus>"#;
        let entries = parse_multistatus(xml, "/remote.php/dav/files/alice").unwrap();
        assert_eq!(entries[0].path, "/");
        assert_eq!(entries[0].name, "/");
        assert!(entries[0].is_dir);
    }
}
