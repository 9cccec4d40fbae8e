use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;

pub type ByteStream = BoxStream<'static, std::result::Result<Bytes, std::io::Error>>;

pub(crate) async fn response_text_truncated(
    response: reqwest::Response,
    max_bytes: usize,
) -> String {
    let stream: ByteStream = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other))
        .boxed();
    let (bytes, truncated) = match read_stream_limited(stream, max_bytes).await {
        Ok(out) => out,
        Err(_) => return String::new(),
    };
    let mut body = String::from_utf8_lossy(&bytes).to_string();
    if truncated {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str("...(truncated)");
    }
    body
}

/// Buffers at most `max_bytes` of `stream`. The second value reports whether the
/// stream had more data than the limit allowed.
pub(crate) async fn read_stream_limited(
    mut stream: ByteStream,
    max_bytes: usize,
) -> std::result::Result<(Vec<u8>, bool), std::io::Error> {
    let max_bytes = max_bytes.max(1);
    let mut out = Vec::<u8>::new();

    while let Some(next) = stream.next().await {
        let chunk = next?;
        let remaining = max_bytes.saturating_sub(out.len());
        if remaining == 0 {
            return Ok((out, true));
        }
        if chunk.len() <= remaining {
            out.extend_from_slice(chunk.as_ref());
        } else {
            out.extend_from_slice(&chunk.as_ref()[..remaining]);
            return Ok((out, true));
        }
    }
    Ok((out, false))
}
