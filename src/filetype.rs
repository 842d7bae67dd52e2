use anyhow::{Context, Result};
use std::path::Path;
use tokio::io::AsyncReadExt;

const SNIFF_LEN: usize = 1024;

/// Guesses the type of a stored file from its first bytes.
///
/// Known magic numbers give a mime type; otherwise the content is reported as
/// `text/UTF-8`, `text/ASCII` or `unknown`.
pub async fn detect(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening '{}' for type detection", path.display()))?;
    let mut buf = vec![0u8; SNIFF_LEN];
    let mut n = 0;
    while n < SNIFF_LEN {
        let read = file.read(&mut buf[n..]).await?;
        if read == 0 {
            break;
        }
        n += read;
    }
    buf.truncate(n);
    Ok(detect_bytes(&buf))
}

pub fn detect_bytes(buf: &[u8]) -> String {
    if let Some(kind) = infer::get(buf) {
        return kind.mime_type().to_string();
    }
    // a multi-byte char cut at the sniff boundary still counts as UTF-8
    let valid_utf8 = match std::str::from_utf8(buf) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none() && buf.len() == SNIFF_LEN,
    };
    if valid_utf8 && !buf.contains(&0) {
        return "text/UTF-8".to_string();
    }
    if buf.iter().all(|b| (32..127).contains(b)) {
        return "text/ASCII".to_string();
    }
    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_bytes() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];
        assert_eq!(detect_bytes(&png), "image/png");
        assert_eq!(detect_bytes("grüße\n".as_bytes()), "text/UTF-8");
        assert_eq!(detect_bytes(&[0x00, 0xff, 0xfe, 0x01]), "unknown");
    }

    #[tokio::test]
    async fn test_detect_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.txt");
        std::fs::write(&path, "hello world").unwrap();
        assert_eq!(detect(&path).await.unwrap(), "text/UTF-8");
        assert!(detect(&dir.path().join("missing")).await.is_err());
    }
}
