use serde::{Deserialize, Serialize};

/// Production pipeline status of a task.
///
/// `*Ready` states plus `FinalReview` are human review gates: workers never
/// claim them, the review surface moves them along. `Published`, `Cancelled`
/// and the `*Error` states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Draft,
    Queued,
    Claimed,
    Cancelled,
    GeneratingAssets,
    AssetsReady,
    AssetsApproved,
    GeneratingComposites,
    CompositesReady,
    GeneratingVideo,
    VideoReady,
    VideoApproved,
    GeneratingAudio,
    AudioReady,
    AudioApproved,
    GeneratingSfx,
    SfxReady,
    Assembling,
    AssemblyReady,
    FinalReview,
    Approved,
    Uploading,
    Published,
    AssetError,
    VideoError,
    AudioError,
    UploadError,
}

use TaskStatus::*;

impl TaskStatus {
    pub const ALL: [TaskStatus; 27] = [
        Draft,
        Queued,
        Claimed,
        Cancelled,
        GeneratingAssets,
        AssetsReady,
        AssetsApproved,
        GeneratingComposites,
        CompositesReady,
        GeneratingVideo,
        VideoReady,
        VideoApproved,
        GeneratingAudio,
        AudioReady,
        AudioApproved,
        GeneratingSfx,
        SfxReady,
        Assembling,
        AssemblyReady,
        FinalReview,
        Approved,
        Uploading,
        Published,
        AssetError,
        VideoError,
        AudioError,
        UploadError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Draft => "draft",
            Queued => "queued",
            Claimed => "claimed",
            Cancelled => "cancelled",
            GeneratingAssets => "generating_assets",
            AssetsReady => "assets_ready",
            AssetsApproved => "assets_approved",
            GeneratingComposites => "generating_composites",
            CompositesReady => "composites_ready",
            GeneratingVideo => "generating_video",
            VideoReady => "video_ready",
            VideoApproved => "video_approved",
            GeneratingAudio => "generating_audio",
            AudioReady => "audio_ready",
            AudioApproved => "audio_approved",
            GeneratingSfx => "generating_sfx",
            SfxReady => "sfx_ready",
            Assembling => "assembling",
            AssemblyReady => "assembly_ready",
            FinalReview => "final_review",
            Approved => "approved",
            Uploading => "uploading",
            Published => "published",
            AssetError => "asset_error",
            VideoError => "video_error",
            AudioError => "audio_error",
            UploadError => "upload_error",
        }
    }

    pub fn parse(raw: &str) -> Option<TaskStatus> {
        TaskStatus::ALL.into_iter().find(|s| s.as_str() == raw)
    }

    /// Human-facing label used on the planning side, e.g. "Video Approved".
    /// `parse_label` inverts it exactly, so the round trip is identity on
    /// all 27 statuses.
    pub fn label(self) -> &'static str {
        match self {
            Draft => "Draft",
            Queued => "Queued",
            Claimed => "Claimed",
            Cancelled => "Cancelled",
            GeneratingAssets => "Generating Assets",
            AssetsReady => "Assets Ready",
            AssetsApproved => "Assets Approved",
            GeneratingComposites => "Generating Composites",
            CompositesReady => "Composites Ready",
            GeneratingVideo => "Generating Video",
            VideoReady => "Video Ready",
            VideoApproved => "Video Approved",
            GeneratingAudio => "Generating Audio",
            AudioReady => "Audio Ready",
            AudioApproved => "Audio Approved",
            GeneratingSfx => "Generating SFX",
            SfxReady => "SFX Ready",
            Assembling => "Assembling",
            AssemblyReady => "Assembly Ready",
            FinalReview => "Final Review",
            Approved => "Approved",
            Uploading => "Uploading",
            Published => "Published",
            AssetError => "Asset Error",
            VideoError => "Video Error",
            AudioError => "Audio Error",
            UploadError => "Upload Error",
        }
    }

    pub fn parse_label(raw: &str) -> Option<TaskStatus> {
        TaskStatus::ALL.into_iter().find(|s| s.label() == raw)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Published | Cancelled | AssetError | VideoError | AudioError | UploadError
        )
    }

    /// Human review gate: automation stops here until approved or rejected.
    pub fn is_gate(self) -> bool {
        matches!(self, AssetsReady | VideoReady | AudioReady | FinalReview)
    }

    /// Statuses the claim query may pick up.
    pub fn is_runnable(self) -> bool {
        self.claim_target().is_some()
    }

    /// Status a claim moves this task into, if it is claimable at all.
    pub fn claim_target(self) -> Option<TaskStatus> {
        match self {
            Queued => Some(Claimed),
            AssetsApproved => Some(GeneratingComposites),
            CompositesReady => Some(GeneratingVideo),
            VideoApproved => Some(GeneratingAudio),
            AudioApproved => Some(GeneratingSfx),
            SfxReady => Some(Assembling),
            Approved => Some(Uploading),
            _ => None,
        }
    }

    /// Worker-owned statuses: a claimed or mid-stage task belongs to exactly
    /// one worker until it advances, fails, or is released.
    pub fn is_in_progress(self) -> bool {
        self.prior_runnable().is_some()
    }

    /// Where an in-progress task goes back to when released or retried.
    pub fn prior_runnable(self) -> Option<TaskStatus> {
        match self {
            Claimed | GeneratingAssets => Some(Queued),
            GeneratingComposites => Some(AssetsApproved),
            GeneratingVideo => Some(CompositesReady),
            GeneratingAudio => Some(VideoApproved),
            GeneratingSfx => Some(AudioApproved),
            Assembling => Some(SfxReady),
            Uploading => Some(Approved),
            _ => None,
        }
    }

    /// Terminal error state a fatal failure in this status maps to.
    pub fn error_state(self) -> Option<TaskStatus> {
        match self {
            Claimed | GeneratingAssets | AssetsReady | GeneratingComposites => Some(AssetError),
            GeneratingVideo | VideoReady | Assembling | FinalReview => Some(VideoError),
            GeneratingAudio | AudioReady | GeneratingSfx => Some(AudioError),
            Uploading => Some(UploadError),
            _ => None,
        }
    }

    /// Gate approval successor, for review-surface writes.
    pub fn approved_successor(self) -> Option<TaskStatus> {
        match self {
            AssetsReady => Some(AssetsApproved),
            VideoReady => Some(VideoApproved),
            AudioReady => Some(AudioApproved),
            FinalReview => Some(Approved),
            _ => None,
        }
    }

    /// Whether `self -> to` is an edge of the pipeline graph. The store
    /// rejects every status write that is not on this graph.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        if to == Cancelled {
            return !self.is_terminal();
        }
        if let Some(target) = self.claim_target() {
            if to == target {
                return true;
            }
        }
        if self.prior_runnable() == Some(to) {
            return true;
        }
        if self.error_state() == Some(to) {
            return true;
        }
        if self.approved_successor() == Some(to) {
            return true;
        }
        matches!(
            (self, to),
            (Draft, Queued)
                | (Claimed, GeneratingAssets)
                | (GeneratingAssets, AssetsReady)
                | (GeneratingComposites, CompositesReady)
                | (GeneratingVideo, VideoReady)
                | (GeneratingAudio, AudioReady)
                | (GeneratingSfx, SfxReady)
                | (Assembling, AssemblyReady)
                | (AssemblyReady, FinalReview)
                | (Uploading, Published)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority. Ordering is by `rank`: high before normal before low.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    pub fn parse(raw: &str) -> Option<Priority> {
        match raw {
            "high" => Some(Priority::High),
            "normal" => Some(Priority::Normal),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }

    /// Label used on the planning side ("High" / "Normal" / "Low").
    pub fn label(self) -> &'static str {
        match self {
            Priority::High => "High",
            Priority::Normal => "Normal",
            Priority::Low => "Low",
        }
    }

    pub fn parse_label(raw: &str) -> Option<Priority> {
        match raw {
            "High" => Some(Priority::High),
            "Normal" => Some(Priority::Normal),
            "Low" => Some(Priority::Low),
            _ => None,
        }
    }

    pub fn rank(self) -> i16 {
        match self {
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_form_round_trips() {
        for status in TaskStatus::ALL {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn status_label_round_trips() {
        for status in TaskStatus::ALL {
            assert_eq!(TaskStatus::parse_label(status.label()), Some(status));
        }
    }

    #[test]
    fn gates_are_never_runnable() {
        for status in TaskStatus::ALL {
            if status.is_gate() {
                assert!(!status.is_runnable(), "{status} is a gate");
            }
        }
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in TaskStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in TaskStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn cancel_is_legal_from_every_non_terminal_state() {
        for from in TaskStatus::ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition_to(TaskStatus::Cancelled), "{from}");
        }
    }

    #[test]
    fn happy_path_walk_is_legal() {
        let path = [
            TaskStatus::Queued,
            TaskStatus::Claimed,
            TaskStatus::GeneratingAssets,
            TaskStatus::AssetsReady,
            TaskStatus::AssetsApproved,
            TaskStatus::GeneratingComposites,
            TaskStatus::CompositesReady,
            TaskStatus::GeneratingVideo,
            TaskStatus::VideoReady,
            TaskStatus::VideoApproved,
            TaskStatus::GeneratingAudio,
            TaskStatus::AudioReady,
            TaskStatus::AudioApproved,
            TaskStatus::GeneratingSfx,
            TaskStatus::SfxReady,
            TaskStatus::Assembling,
            TaskStatus::AssemblyReady,
            TaskStatus::FinalReview,
            TaskStatus::Approved,
            TaskStatus::Uploading,
            TaskStatus::Published,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn review_rejection_never_skips_a_stage() {
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Published));
        assert!(!TaskStatus::AssetsReady.can_transition_to(TaskStatus::VideoApproved));
        assert!(!TaskStatus::GeneratingVideo.can_transition_to(TaskStatus::Uploading));
    }

    #[test]
    fn priority_rank_orders_high_first() {
        assert!(Priority::High.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Low.rank());
    }
}
