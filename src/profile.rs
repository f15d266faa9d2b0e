/// Fixed ffmpeg encoding profile for browser capture republished over RTMP.
/// Browsers record at most 2.5 Mbps video and 128 kbps audio, which is what
/// the bitrate ceiling and audio settings follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingProfile {
    pub frame_rate: u32,
    pub keyframe_interval: u32,
    pub crf: u32,
    pub max_video_bitrate_kbps: u32,
    pub pixel_format: &'static str,
    pub audio_bitrate_kbps: u32,
    pub audio_sample_rate: u32,
    pub format: &'static str,
}

pub const LIVE: EncodingProfile = EncodingProfile {
    frame_rate: 25,
    keyframe_interval: 50,
    crf: 25,
    max_video_bitrate_kbps: 2500,
    pixel_format: "yuv420p",
    audio_bitrate_kbps: 128,
    audio_sample_rate: 32000,
    format: "flv",
};

impl EncodingProfile {
    /// Arguments for reading stdin and encoding, without the output url.
    pub fn ffmpeg_args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::with_capacity(40);
        let mut push = |flag: &str, value: String| {
            args.push(flag.to_string());
            args.push(value);
        };

        push("-i", "-".into());
        push("-c:v", "libx264".into());
        push("-preset", "ultrafast".into());
        push("-tune", "zerolatency".into());
        push("-r", self.frame_rate.to_string());
        push("-g", self.keyframe_interval.to_string());
        push("-keyint_min", self.frame_rate.to_string());
        push("-crf", self.crf.to_string());
        push("-maxrate", format!("{}k", self.max_video_bitrate_kbps));
        push("-bufsize", format!("{}k", self.max_video_bitrate_kbps * 2));
        push("-pix_fmt", self.pixel_format.into());
        push("-sc_threshold", "0".into());
        push("-profile:v", "main".into());
        push("-level", "3.1".into());
        push("-c:a", "aac".into());
        push("-b:a", format!("{}k", self.audio_bitrate_kbps));
        push("-ar", self.audio_sample_rate.to_string());
        push("-f", self.format.into());
        args
    }
}
