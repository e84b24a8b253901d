//! Event taxonomy: the closed set of event tags and the aggregates they
//! describe.
//!
//! The taxonomy is data, not control flow. [`EVENT_CATALOG`] holds one row per
//! tag (wire name + lineage relevance) and [`AGGREGATE_PREFIXES`] maps a tag
//! name to its aggregate. Adding an event type means adding a variant and a
//! catalog row.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Business entity kind an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregateType {
    /// Requirement document (request for proposal).
    Rfp,
    Requirement,
    UserStory,
    Task,
    Sprint,
}

/// Tag-name prefix → aggregate. Checked in order; the first match wins.
pub const AGGREGATE_PREFIXES: &[(&str, AggregateType)] = &[
    ("RFP_", AggregateType::Rfp),
    ("REQUIREMENT_", AggregateType::Requirement),
    ("STORY_", AggregateType::UserStory),
    ("TASK_", AggregateType::Task),
    ("SPRINT_", AggregateType::Sprint),
];

impl AggregateType {
    pub const ALL: [AggregateType; 5] = [
        AggregateType::Rfp,
        AggregateType::Requirement,
        AggregateType::UserStory,
        AggregateType::Task,
        AggregateType::Sprint,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rfp => "RFP",
            Self::Requirement => "REQUIREMENT",
            Self::UserStory => "USER_STORY",
            Self::Task => "TASK",
            Self::Sprint => "SPRINT",
        }
    }

    /// Resolve the aggregate for an event tag name (e.g. `STORY_TASK_LINKED`
    /// → `USER_STORY`). Returns `None` for names outside the taxonomy.
    pub fn for_event_name(name: &str) -> Option<Self> {
        AGGREGATE_PREFIXES
            .iter()
            .find(|(prefix, _)| name.starts_with(prefix))
            .map(|(_, aggregate)| *aggregate)
    }
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregateType {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| UnknownTag(s.to_owned()))
    }
}

/// Event tag. Discriminants index into [`EVENT_CATALOG`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RfpUploaded,
    RfpUpdated,
    RfpDeleted,
    RfpRequirementsExtracted,
    RequirementCreated,
    RequirementUpdated,
    RequirementDeleted,
    RequirementStoryLinked,
    RequirementStoryUnlinked,
    StoryCreated,
    StoryUpdated,
    StoryDeleted,
    StoryStatusChanged,
    StoryTaskLinked,
    StoryTaskUnlinked,
    StorySprintAssigned,
    TaskCreated,
    TaskUpdated,
    TaskDeleted,
    TaskStatusChanged,
    TaskAssigned,
    SprintCreated,
    SprintUpdated,
    SprintStarted,
    SprintCompleted,
    SprintDeleted,
}

/// Catalog row for one event tag.
#[derive(Debug, Clone, Copy)]
pub struct EventSpec {
    pub event_type: EventType,
    pub name: &'static str,
    /// Whether the event changes nodes or edges of the traceability graph.
    /// Attribute-only changes are still published; lineage projectors may
    /// skip them.
    pub lineage: bool,
}

const fn spec(event_type: EventType, name: &'static str, lineage: bool) -> EventSpec {
    EventSpec {
        event_type,
        name,
        lineage,
    }
}

pub const EVENT_CATALOG: &[EventSpec] = &[
    spec(EventType::RfpUploaded, "RFP_UPLOADED", true),
    spec(EventType::RfpUpdated, "RFP_UPDATED", false),
    spec(EventType::RfpDeleted, "RFP_DELETED", true),
    spec(EventType::RfpRequirementsExtracted, "RFP_REQUIREMENTS_EXTRACTED", true),
    spec(EventType::RequirementCreated, "REQUIREMENT_CREATED", true),
    spec(EventType::RequirementUpdated, "REQUIREMENT_UPDATED", false),
    spec(EventType::RequirementDeleted, "REQUIREMENT_DELETED", true),
    spec(EventType::RequirementStoryLinked, "REQUIREMENT_STORY_LINKED", true),
    spec(EventType::RequirementStoryUnlinked, "REQUIREMENT_STORY_UNLINKED", true),
    spec(EventType::StoryCreated, "STORY_CREATED", true),
    spec(EventType::StoryUpdated, "STORY_UPDATED", false),
    spec(EventType::StoryDeleted, "STORY_DELETED", true),
    spec(EventType::StoryStatusChanged, "STORY_STATUS_CHANGED", false),
    spec(EventType::StoryTaskLinked, "STORY_TASK_LINKED", true),
    spec(EventType::StoryTaskUnlinked, "STORY_TASK_UNLINKED", true),
    spec(EventType::StorySprintAssigned, "STORY_SPRINT_ASSIGNED", true),
    spec(EventType::TaskCreated, "TASK_CREATED", true),
    spec(EventType::TaskUpdated, "TASK_UPDATED", false),
    spec(EventType::TaskDeleted, "TASK_DELETED", true),
    spec(EventType::TaskStatusChanged, "TASK_STATUS_CHANGED", false),
    spec(EventType::TaskAssigned, "TASK_ASSIGNED", false),
    spec(EventType::SprintCreated, "SPRINT_CREATED", true),
    spec(EventType::SprintUpdated, "SPRINT_UPDATED", false),
    spec(EventType::SprintStarted, "SPRINT_STARTED", false),
    spec(EventType::SprintCompleted, "SPRINT_COMPLETED", false),
    spec(EventType::SprintDeleted, "SPRINT_DELETED", true),
];

impl EventType {
    pub fn spec(self) -> &'static EventSpec {
        &EVENT_CATALOG[self as usize]
    }

    pub fn as_str(self) -> &'static str {
        self.spec().name
    }

    pub fn is_lineage_relevant(self) -> bool {
        self.spec().lineage
    }

    pub fn aggregate_type(self) -> AggregateType {
        // Every catalog name carries a known prefix (checked by tests).
        AggregateType::for_event_name(self.as_str()).unwrap_or(AggregateType::Rfp)
    }

    pub fn all() -> impl Iterator<Item = EventType> {
        EVENT_CATALOG.iter().map(|s| s.event_type)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EVENT_CATALOG
            .iter()
            .find(|spec| spec.name == s)
            .map(|spec| spec.event_type)
            .ok_or_else(|| UnknownTag(s.to_owned()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tag: {0}")]
pub struct UnknownTag(pub String);
