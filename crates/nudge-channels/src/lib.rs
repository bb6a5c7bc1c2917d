pub mod line;
pub mod registry;
pub mod slack;
pub mod telegram;

pub use registry::ChannelRegistry;

/// Split `text` into chunks of at most `limit` bytes, preferring newline
/// boundaries and never cutting inside a UTF-8 character.
pub fn split_text(text: &str, limit: usize) -> Vec<String> {
    if text.len() <= limit {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut remaining = text;
    while remaining.len() > limit {
        let mut end = limit;
        while !remaining.is_char_boundary(end) {
            end -= 1;
        }
        let cut = match remaining[..end].rfind('\n') {
            Some(i) if i > 0 => i,
            _ => end,
        };
        chunks.push(remaining[..cut].to_string());
        remaining = remaining[cut..].trim_start_matches('\n');
    }
    if !remaining.is_empty() {
        chunks.push(remaining.to_string());
    }
    chunks
}
