//! Form bodies: `multipart/form-data` or `application/x-www-form-urlencoded`.
//!
//! A multipart form is encoded lazily into a list of segments: in-memory
//! bytes for boundaries, part headers and values, and file references that
//! the writer streams from disk. The total length is known up front, so a
//! form is always sent with `Content-Length`.

use crate::ClientError;
use bytes::{BufMut, Bytes, BytesMut};
use mime::Mime;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormEncoding {
    Multipart,
    UrlEncoded,
}

#[derive(Debug, Clone)]
pub struct Form {
    parts: Vec<Part>,
    encoding: FormEncoding,
    boundary: String,
}

#[derive(Debug, Clone)]
pub struct Part {
    name: String,
    body: PartBody,
    filename: Option<String>,
    content_type: Option<Mime>,
}

#[derive(Debug, Clone)]
enum PartBody {
    Text(String),
    Bytes(Bytes),
    File(PathBuf),
    Temp(TempFile),
}

/// A file deleted from disk once the last request referencing it is dropped.
#[derive(Debug, Clone)]
pub struct TempFile {
    inner: Arc<TempFileInner>,
}

#[derive(Debug)]
struct TempFileInner {
    path: PathBuf,
}

impl TempFile {
    /// Take ownership of an existing file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { inner: Arc::new(TempFileInner { path: path.into() }) }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl Drop for TempFileInner {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), cause = %e, "can't remove temp file");
        }
    }
}

/// One piece of an encoded form body.
#[derive(Debug, Clone)]
pub(crate) enum FormSegment {
    Bytes(Bytes),
    File { path: PathBuf, len: u64 },
}

#[derive(Debug)]
pub(crate) struct EncodedForm {
    pub(crate) segments: Vec<FormSegment>,
    pub(crate) length: u64,
}

impl Default for Form {
    fn default() -> Self {
        Self::new()
    }
}

impl Form {
    /// An empty `multipart/form-data` form with a random boundary.
    pub fn new() -> Self {
        Self { parts: Vec::new(), encoding: FormEncoding::Multipart, boundary: format!("micro-client-{}", uuid::Uuid::new_v4().simple()) }
    }

    /// An empty `application/x-www-form-urlencoded` form.
    pub fn url_encoded() -> Self {
        Self { encoding: FormEncoding::UrlEncoded, ..Self::new() }
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(Part { name: name.into(), body: PartBody::Text(value.into()), filename: None, content_type: None });
        self
    }

    pub fn bytes(mut self, name: impl Into<String>, filename: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let filename = filename.into();
        let content_type = Some(mime_guess::from_path(&filename).first_or_octet_stream());
        self.parts.push(Part { name: name.into(), body: PartBody::Bytes(data.into()), filename: Some(filename), content_type });
        self
    }

    pub fn file(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let part = Part::for_file(name.into(), &path, PartBody::File(path.clone()));
        self.parts.push(part);
        self
    }

    pub fn temp_file(mut self, name: impl Into<String>, file: TempFile) -> Self {
        let path = file.path().to_path_buf();
        let part = Part::for_file(name.into(), &path, PartBody::Temp(file));
        self.parts.push(part);
        self
    }

    pub fn encoding(&self) -> FormEncoding {
        self.encoding
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn content_type(&self) -> String {
        match self.encoding {
            FormEncoding::Multipart => format!("multipart/form-data; boundary={}", self.boundary),
            FormEncoding::UrlEncoded => mime::APPLICATION_WWW_FORM_URLENCODED.to_string(),
        }
    }

    pub(crate) async fn encode(&self) -> Result<EncodedForm, ClientError> {
        match self.encoding {
            FormEncoding::UrlEncoded => {
                let body = Bytes::from(self.url_encode()?);
                Ok(EncodedForm { length: body.len() as u64, segments: vec![FormSegment::Bytes(body)] })
            }
            FormEncoding::Multipart => self.multipart_encode().await,
        }
    }

    fn url_encode(&self) -> Result<String, ClientError> {
        let mut fields = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            let value = match &part.body {
                PartBody::Text(text) => text.as_str(),
                PartBody::Bytes(bytes) => std::str::from_utf8(bytes)
                    .map_err(|e| ClientError::invalid_request(format!("form field {} is not utf-8: {e}", part.name)))?,
                PartBody::File(_) | PartBody::Temp(_) => {
                    return Err(ClientError::invalid_request(format!("file part {} needs a multipart form", part.name)));
                }
            };
            fields.push((part.name.as_str(), value));
        }
        serde_urlencoded::to_string(&fields).map_err(|e| ClientError::invalid_request(format!("can't encode form: {e}")))
    }

    async fn multipart_encode(&self) -> Result<EncodedForm, ClientError> {
        let mut segments = Vec::with_capacity(self.parts.len() * 2 + 1);
        let mut length = 0u64;
        let mut buf = BytesMut::new();

        for part in &self.parts {
            part.write_headers(&self.boundary, &mut buf);
            match &part.body {
                PartBody::Text(text) => buf.put_slice(text.as_bytes()),
                PartBody::Bytes(bytes) => buf.put_slice(bytes),
                PartBody::File(path) => flush_file(path, &mut buf, &mut segments, &mut length).await?,
                PartBody::Temp(file) => flush_file(file.path(), &mut buf, &mut segments, &mut length).await?,
            }
            buf.put_slice(b"\r\n");
        }
        write!(FormWrite(&mut buf), "--{}--\r\n", self.boundary).map_err(|_e| ClientError::invalid_request("can't write boundary"))?;

        length += buf.len() as u64;
        segments.push(FormSegment::Bytes(buf.freeze()));
        Ok(EncodedForm { segments, length })
    }
}

async fn flush_file(path: &Path, buf: &mut BytesMut, segments: &mut Vec<FormSegment>, length: &mut u64) -> Result<(), ClientError> {
    let len = tokio::fs::metadata(path)
        .await
        .map_err(|e| ClientError::invalid_request(format!("can't read {}: {e}", path.display())))?
        .len();
    if !buf.is_empty() {
        *length += buf.len() as u64;
        segments.push(FormSegment::Bytes(buf.split().freeze()));
    }
    *length += len;
    segments.push(FormSegment::File { path: path.to_path_buf(), len });
    Ok(())
}

impl Part {
    fn for_file(name: String, path: &Path, body: PartBody) -> Self {
        let filename = path.file_name().map(|name| name.to_string_lossy().into_owned());
        let content_type = Some(mime_guess::from_path(path).first_or_octet_stream());
        Part { name, body, filename, content_type }
    }

    fn write_headers(&self, boundary: &str, buf: &mut BytesMut) {
        let mut out = FormWrite(buf);
        // writing into memory can't fail
        let _ = write!(out, "--{boundary}\r\nContent-Disposition: form-data; name=\"{}\"", escape(&self.name));
        if let Some(filename) = &self.filename {
            let _ = write!(out, "; filename=\"{}\"", escape(filename));
        }
        let _ = write!(out, "\r\n");
        if let Some(content_type) = &self.content_type {
            let _ = write!(out, "Content-Type: {content_type}\r\n");
        }
        let _ = write!(out, "\r\n");
    }
}

fn escape(value: &str) -> String {
    value.replace('"', "%22").replace('\r', "%0D").replace('\n', "%0A")
}

struct FormWrite<'a>(&'a mut BytesMut);

impl Write for FormWrite<'_> {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        self.0.put_slice(s.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use std::io::Write as _;

    fn collect(encoded: &EncodedForm) -> String {
        let mut out = String::new();
        for segment in &encoded.segments {
            match segment {
                FormSegment::Bytes(bytes) => out.push_str(std::str::from_utf8(bytes).unwrap()),
                FormSegment::File { path, .. } => out.push_str(&std::fs::read_to_string(path).unwrap()),
            }
        }
        out
    }

    #[tokio::test]
    async fn url_encoded_fields() {
        let form = Form::url_encoded().text("name", "a b").text("lang", "rust&go");
        assert_eq!(form.content_type(), "application/x-www-form-urlencoded");

        let encoded = form.encode().await.unwrap();
        assert_eq!(collect(&encoded), "name=a+b&lang=rust%26go");
        assert_eq!(encoded.length, 23);
    }

    #[tokio::test]
    async fn url_encoded_rejects_files() {
        let form = Form::url_encoded().file("upload", "/tmp/whatever.txt");
        assert!(form.encode().await.is_err());
    }

    #[tokio::test]
    async fn multipart_layout_and_length() {
        let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        file.write_all(b"file content").unwrap();

        let form = Form::new().text("title", "hello").file("upload", file.path());
        let boundary = form.boundary().to_owned();
        let filename = file.path().file_name().unwrap().to_string_lossy().into_owned();

        let encoded = form.encode().await.unwrap();
        assert_eq!(encoded.segments.len(), 3);

        let expected = format!(
            indoc! {"
                --{b}\r
                Content-Disposition: form-data; name=\"title\"\r
                \r
                hello\r
                --{b}\r
                Content-Disposition: form-data; name=\"upload\"; filename=\"{f}\"\r
                Content-Type: text/plain\r
                \r
                file content\r
                --{b}--\r
            "},
            b = boundary,
            f = filename
        );
        let body = collect(&encoded);
        assert_eq!(body, expected);
        assert_eq!(encoded.length, body.len() as u64);
    }

    #[test]
    fn temp_file_removed_with_last_clone() {
        let path = tempfile::NamedTempFile::new().unwrap().into_temp_path().keep().unwrap();
        let temp = TempFile::new(&path);
        let clone = temp.clone();

        drop(temp);
        assert!(path.exists());
        drop(clone);
        assert!(!path.exists());
    }
}
