use crate::{
    archive::ArchiveError,
    auth::AuthError,
    config::ConfigError,
    ffmpeg::FfmpegError,
    hls::PlaylistError,
    stitch::StitchError,
    subscription::SubscriptionError,
    twitch::ApiError,
    util::HttpError,
    worker::CaptureError,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Ffmpeg(#[from] FfmpegError),
    #[error(transparent)]
    Playlist(#[from] PlaylistError),
    #[error(transparent)]
    Stitch(#[from] StitchError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

fn api_code(e: &ApiError) -> i32 {
    match e {
        ApiError::Auth(_) => 2,
        ApiError::RateLimited => 6,
        ApiError::Unauthorized => 7,
        _ => 1,
    }
}

fn capture_code(e: &CaptureError) -> i32 {
    match e {
        CaptureError::NoStreamAvailable { .. } => 4,
        CaptureError::Subprocess(_) => 5,
        _ => 1,
    }
}

impl Error {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 8,
            Error::Auth(_) => 2,
            Error::Api(e) => api_code(e),
            Error::Subscription(SubscriptionError::HubRejected { .. }) => 3,
            Error::Subscription(SubscriptionError::Api(e)) => api_code(e),
            Error::Capture(e) => capture_code(e),
            Error::Ffmpeg(_) => 5,
            Error::Stitch(StitchError::Subprocess(_)) => 5,
            Error::Stitch(StitchError::Capture(e)) => capture_code(e),
            Error::Archive(ArchiveError::Subprocess(_)) => 5,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit(program: &str) -> FfmpegError {
        FfmpegError::Exit {
            program: program.into(),
            code: Some(1),
            stderr: "boom".into(),
        }
    }

    #[test]
    fn exit_codes_are_distinct_per_kind() {
        let cases: Vec<(Error, i32)> = vec![
            (Error::Other("x".into()), 1),
            (AuthError::Missing.into(), 2),
            (ApiError::Auth(AuthError::Missing).into(), 2),
            (
                SubscriptionError::HubRejected {
                    status: 400,
                    body: "bad".into(),
                }
                .into(),
                3,
            ),
            (
                CaptureError::NoStreamAvailable {
                    channel: "c".into(),
                    qualities: vec!["best".into()],
                }
                .into(),
                4,
            ),
            (exit("ffmpeg").into(), 5),
            (CaptureError::Subprocess(exit("ffmpeg")).into(), 5),
            (StitchError::Subprocess(exit("ffprobe")).into(), 5),
            (ApiError::RateLimited.into(), 6),
            (SubscriptionError::Api(ApiError::RateLimited).into(), 6),
            (ApiError::Unauthorized.into(), 7),
            (ConfigError::Invalid("empty".into()).into(), 8),
        ];
        for (error, code) in cases {
            assert_eq!(error.exit_code(), code, "{:?}", error);
        }
    }

    #[test]
    fn messages_pass_through() {
        let e: Error = ConfigError::Invalid("client_id must not be empty".into()).into();
        assert_eq!(e.to_string(), "Invalid config: client_id must not be empty");
    }
}
