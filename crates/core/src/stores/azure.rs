use crate::error::StorageError;
use crate::traits::RemoteStorage;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use percent_encoding::percent_decode_str;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::{Client, Method, StatusCode};
use sha2::Sha256;
use std::time::Duration;
use url::Url;

const API_VERSION: &str = "2021-08-06";
const BACKEND: &str = "azure";

/// Azure Blob Storage (or an ADLS Gen2 account through its blob endpoint),
/// authenticated with the account's SharedKey.
pub struct AzureBlobStorage {
    client: Client,
    account: String,
    key: Vec<u8>,
    container: String,
    endpoint: String,
}

impl AzureBlobStorage {
    pub fn new(
        account: impl Into<String>,
        access_key: &str,
        container: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let account = account.into();
        let endpoint = format!("https://{account}.blob.core.windows.net");
        Self::with_endpoint(account, access_key, container, endpoint)
    }

    /// Custom endpoint, e.g. an emulator (`http://127.0.0.1:10000/devstoreaccount1`).
    pub fn with_endpoint(
        account: impl Into<String>,
        access_key: &str,
        container: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let account = account.into();
        if account.trim().is_empty() {
            return Err(StorageError::MissingCredentials(
                "storage account name".to_string(),
            ));
        }
        if access_key.trim().is_empty() {
            return Err(StorageError::MissingCredentials(
                "storage account key".to_string(),
            ));
        }
        let key = STANDARD
            .decode(access_key.trim())
            .map_err(|error| StorageError::Config(format!("account key is not base64: {error}")))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            account,
            key,
            container: container.into(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    fn container_url(&self) -> Result<Url, StorageError> {
        Ok(Url::parse(&format!("{}/{}", self.endpoint, self.container))?)
    }

    fn blob_url(&self, path: &str) -> Result<Url, StorageError> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() || trimmed.split('/').any(|segment| segment == "..") {
            return Err(StorageError::InvalidPath(path.to_string()));
        }

        let mut url = self.container_url()?;
        url.path_segments_mut()
            .map_err(|_| StorageError::Config(format!("endpoint cannot hold paths: {}", self.endpoint)))?
            .extend(trimmed.split('/'));
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, StorageError> {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let content_length = body.as_ref().map(Vec::len).unwrap_or(0);
        let content_type = if body.is_some() {
            "application/octet-stream"
        } else {
            ""
        };

        let mut ms_headers = vec![
            ("x-ms-date".to_string(), date),
            ("x-ms-version".to_string(), API_VERSION.to_string()),
        ];
        if body.is_some() {
            ms_headers.push(("x-ms-blob-type".to_string(), "BlockBlob".to_string()));
        }

        let to_sign = string_to_sign(
            method.as_str(),
            content_length,
            content_type,
            &ms_headers,
            &self.account,
            &url,
        );
        let signature = self.signature(&to_sign)?;

        let mut request = self
            .client
            .request(method, url)
            .header(
                "Authorization",
                format!("SharedKey {}:{}", self.account, signature),
            );
        for (name, value) in &ms_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(bytes) = body {
            request = request
                .header("Content-Type", content_type)
                .header("Content-Length", content_length.to_string())
                .body(bytes);
        }

        Ok(request.send().await?)
    }

    fn signature(&self, to_sign: &str) -> Result<String, StorageError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
            .map_err(|error| StorageError::Config(format!("unusable account key: {error}")))?;
        mac.update(to_sign.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    fn status_error(status: StatusCode, path: &str) -> StorageError {
        StorageError::Status {
            backend: BACKEND.to_string(),
            status: status.as_u16(),
            path: path.to_string(),
        }
    }
}

#[async_trait]
impl RemoteStorage for AzureBlobStorage {
    fn backend(&self) -> &str {
        BACKEND
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = match prefix.trim_matches('/') {
            "" => String::new(),
            trimmed => format!("{trimmed}/"),
        };

        let mut paths = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut url = self.container_url()?;
            {
                let mut query = url.query_pairs_mut();
                query
                    .append_pair("restype", "container")
                    .append_pair("comp", "list")
                    .append_pair("include", "metadata");
                if !prefix.is_empty() {
                    query.append_pair("prefix", &prefix);
                }
                if let Some(marker) = &marker {
                    query.append_pair("marker", marker);
                }
            }

            let response = self.send(Method::GET, url, None).await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(Vec::new());
            }
            if !response.status().is_success() {
                return Err(Self::status_error(response.status(), &prefix));
            }

            let page = parse_list_blobs(&response.text().await?)?;
            paths.extend(page.names);
            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        Ok(paths)
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.send(Method::GET, self.blob_url(path)?, None).await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response.status(), path));
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let response = self
            .send(Method::PUT, self.blob_url(path)?, Some(bytes.to_vec()))
            .await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response.status(), path));
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let response = self.send(Method::DELETE, self.blob_url(path)?, None).await?;
        if response.status() == StatusCode::NOT_FOUND || response.status().is_success() {
            return Ok(());
        }
        Err(Self::status_error(response.status(), path))
    }
}

/// SharedKey string-to-sign for the Blob service: standard headers, then the
/// sorted `x-ms-*` headers, then the canonicalized resource.
fn string_to_sign(
    method: &str,
    content_length: usize,
    content_type: &str,
    ms_headers: &[(String, String)],
    account: &str,
    url: &Url,
) -> String {
    let content_length = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };

    let mut headers = ms_headers
        .iter()
        .map(|(name, value)| (name.to_lowercase(), value.trim().to_string()))
        .collect::<Vec<_>>();
    headers.sort();
    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();

    let mut params = url
        .query_pairs()
        .map(|(name, value)| (name.to_lowercase(), value.into_owned()))
        .collect::<Vec<_>>();
    params.sort();
    let mut canonical_resource = format!("/{}{}", account, url.path());
    for (name, value) in params {
        canonical_resource.push_str(&format!("\n{name}:{value}"));
    }

    [
        method,
        "",
        "",
        content_length.as_str(),
        "",
        content_type,
        "",
        "",
        "",
        "",
        "",
        "",
    ]
    .join("\n")
        + "\n"
        + &canonical_headers
        + &canonical_resource
}

struct ListPage {
    names: Vec<String>,
    next_marker: Option<String>,
}

#[derive(Default)]
struct BlobEntry {
    name: String,
    encoded: bool,
    folder: bool,
}

/// Reads one `List Blobs` response page. Folder markers of hierarchical
/// namespaces are skipped and `Encoded="true"` names are percent-decoded.
fn parse_list_blobs(xml: &str) -> Result<ListPage, StorageError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut names = Vec::new();
    let mut next_marker: Option<String> = None;
    let mut blob = BlobEntry::default();

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(element) => {
                let name = String::from_utf8_lossy(element.local_name().as_ref()).into_owned();
                match name.as_str() {
                    "Blob" => blob = BlobEntry::default(),
                    "Name" => {
                        blob.encoded = element
                            .try_get_attribute("Encoded")
                            .map_err(xml_error)?
                            .is_some_and(|attribute| attribute.value.as_ref() == b"true");
                    }
                    _ => {}
                }
                path.push(name);
            }
            Event::Text(text) => {
                let value = text.unescape().map_err(xml_error)?;
                collect_text(&path, &value, &mut blob, &mut next_marker);
            }
            Event::CData(data) => {
                let value = String::from_utf8_lossy(&data.into_inner()).into_owned();
                collect_text(&path, &value, &mut blob, &mut next_marker);
            }
            Event::End(element) => {
                if element.local_name().as_ref() == b"Blob" && !blob.folder && !blob.name.is_empty() {
                    let entry = std::mem::take(&mut blob);
                    names.push(if entry.encoded {
                        percent_decode_str(&entry.name).decode_utf8_lossy().into_owned()
                    } else {
                        entry.name
                    });
                }
                path.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(ListPage {
        names,
        next_marker: next_marker.filter(|marker| !marker.is_empty()),
    })
}

fn collect_text(
    path: &[String],
    value: &str,
    blob: &mut BlobEntry,
    next_marker: &mut Option<String>,
) {
    let path: Vec<&str> = path.iter().map(String::as_str).collect();
    match path.as_slice() {
        [.., "Blobs", "Blob", "Name"] => blob.name.push_str(value),
        [.., "Blob", "Metadata", "hdi_isfolder"] => {
            blob.folder = value.trim().eq_ignore_ascii_case("true");
        }
        ["EnumerationResults", "NextMarker"] => {
            next_marker.get_or_insert_with(String::new).push_str(value);
        }
        _ => {}
    }
}

fn xml_error(error: impl std::fmt::Display) -> StorageError {
    StorageError::Xml(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "c2VjcmV0LWtleS1mb3ItdGVzdHM=";

    #[test]
    fn missing_key_is_a_credentials_error() {
        assert!(matches!(
            AzureBlobStorage::new("juridicai", "", "data"),
            Err(StorageError::MissingCredentials(_))
        ));
        assert!(matches!(
            AzureBlobStorage::new("juridicai", "not base64!", "data"),
            Err(StorageError::Config(_))
        ));
    }

    #[test]
    fn blob_urls_encode_segments() -> Result<(), StorageError> {
        let storage = AzureBlobStorage::new("juridicai", KEY, "data")?;
        let url = storage.blob_url("vector_index/law text/records.jsonl")?;
        assert_eq!(
            url.as_str(),
            "https://juridicai.blob.core.windows.net/data/vector_index/law%20text/records.jsonl"
        );
        assert!(storage.blob_url("../secrets").is_err());
        Ok(())
    }

    #[test]
    fn string_to_sign_canonicalizes_headers_and_query() -> Result<(), url::ParseError> {
        let url = Url::parse(
            "https://juridicai.blob.core.windows.net/data?restype=container&comp=list&prefix=vector_index/",
        )?;
        let headers = vec![
            ("x-ms-version".to_string(), API_VERSION.to_string()),
            ("x-ms-date".to_string(), "Mon, 05 Oct 2026 10:00:00 GMT".to_string()),
        ];

        let signed = string_to_sign("GET", 0, "", &headers, "juridicai", &url);
        let expected = "GET\n\n\n\n\n\n\n\n\n\n\n\n\
            x-ms-date:Mon, 05 Oct 2026 10:00:00 GMT\n\
            x-ms-version:2021-08-06\n\
            /juridicai/data\n\
            comp:list\n\
            prefix:vector_index/\n\
            restype:container";
        assert_eq!(signed, expected);
        Ok(())
    }

    #[test]
    fn content_length_is_signed_for_uploads() -> Result<(), url::ParseError> {
        let url = Url::parse("https://juridicai.blob.core.windows.net/data/a.json")?;
        let signed = string_to_sign("PUT", 12, "application/octet-stream", &[], "juridicai", &url);
        assert!(signed.starts_with("PUT\n\n\n12\n\napplication/octet-stream\n"));
        assert!(signed.ends_with("/juridicai/data/a.json"));
        Ok(())
    }

    #[test]
    fn list_response_skips_folders_and_reads_marker() -> Result<(), StorageError> {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
            <EnumerationResults ContainerName="data">
              <Blobs>
                <Blob><Name>vector_index/law_text</Name><Metadata><hdi_isfolder>true</hdi_isfolder></Metadata></Blob>
                <Blob><Name>vector_index/law_text/records.jsonl</Name><Properties /></Blob>
                <Blob><Name>vector_index/R&amp;D.json</Name></Blob>
              </Blobs>
              <NextMarker>2!token</NextMarker>
            </EnumerationResults>"#;

        let page = parse_list_blobs(xml)?;
        assert_eq!(
            page.names,
            vec!["vector_index/law_text/records.jsonl", "vector_index/R&D.json"]
        );
        assert_eq!(page.next_marker.as_deref(), Some("2!token"));

        let last = parse_list_blobs("<EnumerationResults><Blobs></Blobs><NextMarker /></EnumerationResults>")?;
        assert!(last.names.is_empty());
        assert!(last.next_marker.is_none());
        Ok(())
    }

    #[test]
    fn list_response_decodes_encoded_names_and_character_references() -> Result<(), StorageError> {
        let xml = r#"<EnumerationResults>
              <Blobs>
                <Blob><Name Encoded="true">clean_data/arr%C3%AAt%C3%A9%01.txt</Name></Blob>
                <Blob><Name>clean_data/d&#xE9;cret&#32;2012.txt</Name>
                  <Metadata><NextMarker>not-a-marker</NextMarker></Metadata></Blob>
              </Blobs>
              <NextMarker/>
            </EnumerationResults>"#;

        let page = parse_list_blobs(xml)?;
        assert_eq!(
            page.names,
            vec!["clean_data/arrêté\u{1}.txt", "clean_data/décret 2012.txt"]
        );
        assert!(page.next_marker.is_none());
        Ok(())
    }

    #[test]
    fn malformed_listing_is_an_error() {
        let result = parse_list_blobs("<EnumerationResults><Blobs><Blob><Name>a</Blob></EnumerationResults>");
        assert!(matches!(result, Err(StorageError::Xml(_))));
    }
}
