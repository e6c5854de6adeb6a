// Streams a finished audio file to the client and removes it afterwards.
use super::*;

#[derive(Debug)]
pub(crate) struct RemoveOnDrop {
    path: PathBuf,
}

impl RemoveOnDrop {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => log::info!("Removed delivered file {}", self.path.display()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => log::warn!("Failed to remove {}: {error}", self.path.display()),
        }
    }
}

fn is_rfc5987_attr_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric()
        || matches!(
            byte,
            b'!' | b'#' | b'$' | b'&' | b'+' | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~'
        )
}

pub(crate) fn content_disposition(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|ch| {
            if ch.is_ascii() && !ch.is_ascii_control() && ch != '"' && ch != '\\' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let mut encoded = String::with_capacity(file_name.len());
    for byte in file_name.bytes() {
        if is_rfc5987_attr_char(byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}

pub(crate) async fn stream_audio_file(path: PathBuf, delete_after: bool) -> ApiResult<Response> {
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("file not found"));
    }

    let file_name = path
        .file_name()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_default();
    let disposition = HeaderValue::from_str(&content_disposition(&file_name))
        .map_err(|error| ApiError::internal(format!("Failed to build headers: {error}")))?;

    let guard = delete_after.then(|| RemoveOnDrop::new(path.clone()));
    let stream = ReaderStream::new(file).map(move |chunk| {
        let _ = &guard;
        chunk
    });

    let mut response = Body::from_stream(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(audio_mime_for_path(&path)),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    log::info!("Sending {file_name} ({} bytes)", metadata.len());
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_keeps_plain_names_readable() {
        assert_eq!(
            content_disposition("Song.mp3"),
            "attachment; filename=\"Song.mp3\"; filename*=UTF-8''Song.mp3"
        );
    }

    #[test]
    fn disposition_encodes_non_ascii_names() {
        let value = content_disposition("Café \"Live\".mp3");
        assert!(value.starts_with("attachment; filename=\"Caf_ _Live_.mp3\";"));
        assert!(value.ends_with("filename*=UTF-8''Caf%C3%A9%20%22Live%22.mp3"));
        assert!(HeaderValue::from_str(&value).is_ok());
    }

    #[test]
    fn guard_removes_file_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mp3");
        std::fs::write(&path, b"x").unwrap();
        drop(RemoveOnDrop::new(path.clone()));
        assert!(!path.exists());
        drop(RemoveOnDrop::new(path));
    }
}
