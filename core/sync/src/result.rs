//! Typed stage results and the per-pair result trail.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use mirrorsync_common::FieldValue;

use crate::state::SyncState;

/// Declares a closed status enumeration with stable string codes.
macro_rules! status_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($(#[$vmeta:meta])* $variant:ident => $code:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $code),+
                }
            }

            pub fn from_code(code: &str) -> Option<Self> {
                match code {
                    $($code => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

status_enum! {
    /// Outcome of a [`Matcher`](crate::matcher::Matcher) lookup.
    MatchStatus {
        NoMatch => "NO_MATCH",
        FoundMatch => "FOUND_MATCH",
        Error => "ERROR",
    }
}

status_enum! {
    /// Outcome of resolving the counterpart of the origin object.
    OldOrNewMatchStatus {
        /// A persisted sync state linked both sides.
        FetchedSavedMatch => "FETCHED_SAVED_MATCH",
        FoundNewMatch => "FOUND_NEW_MATCH",
        NoMatchFound => "NO_MATCH_FOUND",
        Error => "ERROR",
    }
}

status_enum! {
    /// Whether a pair should be synced now.
    Eligibility {
        Eligible => "ELIGIBLE",
        Ineligible => "INELIGIBLE",
        NotNeeded => "NOT_NEEDED",
    }
}

status_enum! {
    /// Outcome of a [`Mapper`](crate::mapper::Mapper).
    MapStatus {
        Success => "SUCCESS",
        Error => "ERROR",
        SkippedAllChanges => "SKIPPED_ALL_CHANGES",
    }
}

status_enum! {
    /// Outcome of the one-way map-and-write stage.
    MapAndWriteStatus {
        WroteNew => "WROTE_NEW",
        WroteChanges => "WROTE_CHANGES",
        /// The target cannot take updates, or the mapper skipped everything.
        SkippedChanges => "SKIPPED_CHANGES",
        NoChangesToWrite => "NO_CHANGES_TO_WRITE",
        /// The store refused the write or silently dropped values.
        SaveError => "SAVE_ERROR",
        Error => "ERROR",
    }
}

status_enum! {
    /// Top-level outcome of one sync call.
    SyncStatus {
        Success => "SUCCESS",
        Error => "ERROR",
        NoSyncNeeded => "NO_SYNC_NEEDED",
    }
}

status_enum! {
    /// Outcome of propagating a deletion.
    DeletionSyncStatus {
        Deleted => "DELETED",
        NothingToDelete => "NOTHING_TO_DELETE",
        Error => "ERROR",
    }
}

/// Pipeline stage a result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Match,
    OldOrNewMatch,
    Eligibility,
    Map,
    MapAndWrite,
    Sync,
    DeletionSync,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Match => "match",
            Stage::OldOrNewMatch => "old_or_new_match",
            Stage::Eligibility => "eligibility",
            Stage::Map => "map",
            Stage::MapAndWrite => "map_and_write",
            Stage::Sync => "sync",
            Stage::DeletionSync => "deletion_sync",
        }
    }
}

/// A status from any stage.
///
/// Persisted as `"{stage}:{STATUS}"`, e.g. `"map_and_write:SAVE_ERROR"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Outcome {
    Match(MatchStatus),
    OldOrNewMatch(OldOrNewMatchStatus),
    Eligibility(Eligibility),
    Map(MapStatus),
    MapAndWrite(MapAndWriteStatus),
    Sync(SyncStatus),
    DeletionSync(DeletionSyncStatus),
}

impl Outcome {
    pub fn stage(&self) -> Stage {
        match self {
            Outcome::Match(_) => Stage::Match,
            Outcome::OldOrNewMatch(_) => Stage::OldOrNewMatch,
            Outcome::Eligibility(_) => Stage::Eligibility,
            Outcome::Map(_) => Stage::Map,
            Outcome::MapAndWrite(_) => Stage::MapAndWrite,
            Outcome::Sync(_) => Stage::Sync,
            Outcome::DeletionSync(_) => Stage::DeletionSync,
        }
    }

    fn status_str(&self) -> &'static str {
        match self {
            Outcome::Match(s) => s.as_str(),
            Outcome::OldOrNewMatch(s) => s.as_str(),
            Outcome::Eligibility(s) => s.as_str(),
            Outcome::Map(s) => s.as_str(),
            Outcome::MapAndWrite(s) => s.as_str(),
            Outcome::Sync(s) => s.as_str(),
            Outcome::DeletionSync(s) => s.as_str(),
        }
    }

    /// Persisted code.
    pub fn code(&self) -> String {
        format!("{}:{}", self.stage().as_str(), self.status_str())
    }

    /// Parse a persisted code.
    pub fn from_code(code: &str) -> Option<Self> {
        let (stage, status) = code.split_once(':')?;
        match stage {
            "match" => MatchStatus::from_code(status).map(Outcome::Match),
            "old_or_new_match" => OldOrNewMatchStatus::from_code(status).map(Outcome::OldOrNewMatch),
            "eligibility" => Eligibility::from_code(status).map(Outcome::Eligibility),
            "map" => MapStatus::from_code(status).map(Outcome::Map),
            "map_and_write" => MapAndWriteStatus::from_code(status).map(Outcome::MapAndWrite),
            "sync" => SyncStatus::from_code(status).map(Outcome::Sync),
            "deletion_sync" => DeletionSyncStatus::from_code(status).map(Outcome::DeletionSync),
            _ => None,
        }
    }

    /// Whether this outcome reports a failure.
    ///
    /// Eligibility exclusions are expected outcomes, not failures.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Outcome::Match(MatchStatus::Error)
                | Outcome::OldOrNewMatch(OldOrNewMatchStatus::Error)
                | Outcome::Map(MapStatus::Error)
                | Outcome::MapAndWrite(MapAndWriteStatus::SaveError | MapAndWriteStatus::Error)
                | Outcome::Sync(SyncStatus::Error)
                | Outcome::DeletionSync(DeletionSyncStatus::Error)
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

impl From<Outcome> for String {
    fn from(outcome: Outcome) -> Self {
        outcome.code()
    }
}

impl TryFrom<String> for Outcome {
    type Error = String;

    fn try_from(code: String) -> Result<Self, Self::Error> {
        Outcome::from_code(&code).ok_or_else(|| format!("unknown status code '{}'", code))
    }
}

/// Change of one field, for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDiff {
    pub field: &'static str,
    pub before: FieldValue,
    pub after: FieldValue,
}

impl fmt::Display for FieldDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.field, self.before, self.after)
    }
}

/// Optional diagnostics attached to a stage result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultContext {
    /// Field-level diff of a write.
    pub diff: Vec<FieldDiff>,
    /// Target values before a write, by field name.
    pub snapshot: Option<BTreeMap<&'static str, FieldValue>>,
    /// Text of an unexpected error caught at the stage boundary.
    pub error: Option<String>,
    /// Sync state persisted at the end of the pipeline.
    pub sync_state: Option<SyncState>,
    /// Whether the store call of a write reported success.
    pub write_succeeded: Option<bool>,
}

/// Immutable result of one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    pub outcome: Outcome,
    pub message: Option<String>,
    pub context: ResultContext,
}

impl StageResult {
    pub fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            message: None,
            context: ResultContext::default(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_context(mut self, context: ResultContext) -> Self {
        self.context = context;
        self
    }

    pub fn is_error(&self) -> bool {
        self.outcome.is_error()
    }
}

impl fmt::Display for StageResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{} ({})", self.outcome, message),
            None => write!(f, "{}", self.outcome),
        }
    }
}

/// Append-only trail of stage results for one pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultStack {
    results: Vec<StageResult>,
}

impl ResultStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, result: StageResult) {
        self.results.push(result);
    }

    pub fn last(&self) -> Option<&StageResult> {
        self.results.last()
    }

    /// Most recent result of `stage`.
    pub fn last_of(&self, stage: Stage) -> Option<&StageResult> {
        self.results
            .iter()
            .rev()
            .find(|result| result.outcome.stage() == stage)
    }

    /// Whether the most recent result is a failure.
    pub fn ended_in_error(&self) -> bool {
        self.last().is_some_and(StageResult::is_error)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageResult> {
        self.results.iter()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// All outcomes in order.
    pub fn outcomes(&self) -> Vec<Outcome> {
        self.results.iter().map(|result| result.outcome).collect()
    }

    pub fn old_or_new_match(&self) -> Option<OldOrNewMatchStatus> {
        match self.last_of(Stage::OldOrNewMatch)?.outcome {
            Outcome::OldOrNewMatch(status) => Some(status),
            _ => None,
        }
    }

    pub fn eligibility(&self) -> Option<Eligibility> {
        match self.last_of(Stage::Eligibility)?.outcome {
            Outcome::Eligibility(status) => Some(status),
            _ => None,
        }
    }

    pub fn map_and_write(&self) -> Option<MapAndWriteStatus> {
        match self.last_of(Stage::MapAndWrite)?.outcome {
            Outcome::MapAndWrite(status) => Some(status),
            _ => None,
        }
    }

    pub fn sync(&self) -> Option<SyncStatus> {
        match self.last_of(Stage::Sync)?.outcome {
            Outcome::Sync(status) => Some(status),
            _ => None,
        }
    }

    pub fn deletion_sync(&self) -> Option<DeletionSyncStatus> {
        match self.last_of(Stage::DeletionSync)?.outcome {
            Outcome::DeletionSync(status) => Some(status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_parse_back() {
        let outcomes = [
            Outcome::OldOrNewMatch(OldOrNewMatchStatus::FetchedSavedMatch),
            Outcome::Eligibility(Eligibility::NotNeeded),
            Outcome::MapAndWrite(MapAndWriteStatus::SaveError),
            Outcome::DeletionSync(DeletionSyncStatus::NothingToDelete),
        ];
        for outcome in outcomes {
            assert_eq!(Outcome::from_code(&outcome.code()), Some(outcome));
        }
        assert_eq!(
            Outcome::MapAndWrite(MapAndWriteStatus::WroteNew).code(),
            "map_and_write:WROTE_NEW"
        );
        assert_eq!(Outcome::from_code("map_and_write:NOPE"), None);
        assert_eq!(Outcome::from_code("garbage"), None);
    }

    #[test]
    fn test_outcome_serde_uses_code() {
        let json = serde_json::to_string(&Outcome::Sync(SyncStatus::Success)).unwrap();
        assert_eq!(json, "\"sync:SUCCESS\"");
        let back: Outcome = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Outcome::Sync(SyncStatus::Success));
        assert!(serde_json::from_str::<Outcome>("\"sync:MAYBE\"").is_err());
    }

    #[test]
    fn test_exclusions_are_not_errors() {
        assert!(!Outcome::Eligibility(Eligibility::Ineligible).is_error());
        assert!(!Outcome::MapAndWrite(MapAndWriteStatus::SkippedChanges).is_error());
        assert!(Outcome::MapAndWrite(MapAndWriteStatus::SaveError).is_error());
    }

    #[test]
    fn test_result_stack_queries() {
        let mut stack = ResultStack::new();
        assert!(stack.last().is_none());
        assert!(!stack.ended_in_error());

        stack.push(StageResult::new(Outcome::OldOrNewMatch(OldOrNewMatchStatus::NoMatchFound)));
        stack.push(StageResult::new(Outcome::Eligibility(Eligibility::Eligible)));
        stack.push(
            StageResult::new(Outcome::MapAndWrite(MapAndWriteStatus::SaveError))
                .with_message("email already used"),
        );
        assert!(stack.ended_in_error());

        stack.push(StageResult::new(Outcome::Sync(SyncStatus::Error)));
        assert_eq!(stack.len(), 4);
        assert_eq!(stack.eligibility(), Some(Eligibility::Eligible));
        assert_eq!(stack.map_and_write(), Some(MapAndWriteStatus::SaveError));
        assert_eq!(
            stack.last_of(Stage::MapAndWrite).unwrap().message.as_deref(),
            Some("email already used")
        );
        assert!(stack.deletion_sync().is_none());
    }
}
