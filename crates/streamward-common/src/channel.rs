//! Channel identifier normalisation

use thiserror::Error;

/// Longest channel name accepted
pub const MAX_CHANNEL_LEN: usize = 25;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel is empty")]
    Empty,

    #[error("channel is longer than 25 characters: {0}")]
    TooLong(String),

    #[error("channel contains invalid characters: {0}")]
    InvalidCharacters(String),
}

/// Normalise a channel URL or bare name into a lowercase channel identifier
///
/// Accepts `alpha`, `twitch.tv/alpha`, `https://www.twitch.tv/Alpha?ref=x`
/// and similar forms. The result is `[a-z0-9_]{1,25}`.
pub fn normalize_channel(input: &str) -> Result<String, ChannelError> {
    let mut rest = input.trim();

    if let Some((_, after)) = rest.split_once("://") {
        rest = after;
    }
    rest = rest.split(['?', '#']).next().unwrap_or_default();
    rest = rest.trim_matches('/');

    // Host present: take the first path segment after it
    if let Some((host, path)) = rest.split_once('/') {
        if host.contains('.') {
            rest = path.split('/').next().unwrap_or_default();
        }
    }
    let channel = rest.trim().to_ascii_lowercase();

    if channel.is_empty() {
        return Err(ChannelError::Empty);
    }
    if channel.len() > MAX_CHANNEL_LEN {
        return Err(ChannelError::TooLong(channel));
    }
    if !channel
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(ChannelError::InvalidCharacters(channel));
    }
    Ok(channel)
}
