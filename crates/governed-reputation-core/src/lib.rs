use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

/// Score assigned to any status the policy does not name.
pub const DEFAULT_SCORE: f64 = 0.0;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ReputationError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("persistence error: {0}")]
    Persistence(String),
}

/// Policy view of a reported status string.
///
/// The set of statuses agents may send is open; every string lands on exactly
/// one variant, and [`TaskStatus::score`] is total over the variants.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum TaskStatus {
    Success,
    Blocked,
    Failure,
    Other(String),
}

impl TaskStatus {
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "success" => Self::Success,
            "blocked" => Self::Blocked,
            "failure" | "failed" | "error" => Self::Failure,
            _ => Self::Other(value.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::Blocked => "blocked",
            Self::Failure => "failure",
            Self::Other(raw) => raw,
        }
    }

    #[must_use]
    pub fn score(&self) -> f64 {
        match self {
            Self::Success => 1.0,
            Self::Blocked => 0.5,
            Self::Failure => 0.0,
            Self::Other(_) => DEFAULT_SCORE,
        }
    }
}

/// Maps a raw status string to its score.
#[must_use]
pub fn score_for_status(status: &str) -> f64 {
    TaskStatus::parse(status).score()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyEntry {
    pub status: String,
    pub aliases: Vec<String>,
    pub score: f64,
}

/// The status policy as data, in the order it is matched.
#[must_use]
pub fn policy_table() -> Vec<PolicyEntry> {
    vec![
        PolicyEntry {
            status: "success".to_string(),
            aliases: Vec::new(),
            score: TaskStatus::Success.score(),
        },
        PolicyEntry {
            status: "blocked".to_string(),
            aliases: Vec::new(),
            score: TaskStatus::Blocked.score(),
        },
        PolicyEntry {
            status: "failure".to_string(),
            aliases: vec!["failed".to_string(), "error".to_string()],
            score: TaskStatus::Failure.score(),
        },
        PolicyEntry {
            status: "(other)".to_string(),
            aliases: Vec::new(),
            score: DEFAULT_SCORE,
        },
    ]
}

/// The five opaque fields an agent sends when it finishes a task.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TaskReport {
    pub task_id: String,
    pub agent_id: String,
    pub objective: String,
    pub status: String,
    pub details: String,
}

impl TaskReport {
    /// Checks that identity and status fields are present.
    ///
    /// `objective` and `details` are free text and may be anything, including
    /// the empty string.
    ///
    /// # Errors
    /// Returns [`ReputationError::Validation`] when `task_id`, `agent_id` or
    /// `status` is empty or whitespace.
    pub fn validate(&self) -> Result<(), ReputationError> {
        for (name, value) in [
            ("task_id", &self.task_id),
            ("agent_id", &self.agent_id),
            ("status", &self.status),
        ] {
            if value.trim().is_empty() {
                return Err(ReputationError::Validation(format!(
                    "{name} MUST be provided for every report"
                )));
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn score(&self) -> f64 {
        score_for_status(&self.status)
    }
}

/// One persisted outcome row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskOutcome {
    pub outcome_seq: i64,
    pub task_id: String,
    pub agent_id: String,
    pub objective: String,
    pub status: String,
    pub score: f64,
    pub details: String,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl TaskOutcome {
    #[must_use]
    pub fn task_status(&self) -> TaskStatus {
        TaskStatus::parse(&self.status)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentStats {
    pub agent_id: String,
    pub task_count: u64,
    pub mean_score: Option<f64>,
    pub success_count: u64,
    pub blocked_count: u64,
    pub failure_count: u64,
    pub other_count: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_recorded_at: Option<OffsetDateTime>,
}

impl AgentStats {
    /// Aggregate for an agent with no recorded outcomes.
    #[must_use]
    pub fn empty(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            task_count: 0,
            mean_score: None,
            success_count: 0,
            blocked_count: 0,
            failure_count: 0,
            other_count: 0,
            last_recorded_at: None,
        }
    }
}

/// Folds an agent's outcome rows into summary statistics.
///
/// Rows for other agents are ignored. Input order does not matter.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn summarize_agent(agent_id: &str, outcomes: &[TaskOutcome]) -> AgentStats {
    let mut stats = AgentStats::empty(agent_id);
    let mut score_sum = 0.0_f64;

    for outcome in outcomes.iter().filter(|item| item.agent_id == agent_id) {
        stats.task_count += 1;
        score_sum += outcome.score;

        match outcome.task_status() {
            TaskStatus::Success => stats.success_count += 1,
            TaskStatus::Blocked => stats.blocked_count += 1,
            TaskStatus::Failure => stats.failure_count += 1,
            TaskStatus::Other(_) => stats.other_count += 1,
        }

        let newer = match stats.last_recorded_at {
            Some(latest) => outcome.recorded_at > latest,
            None => true,
        };
        if newer {
            stats.last_recorded_at = Some(outcome.recorded_at);
        }
    }

    if stats.task_count > 0 {
        stats.mean_score = Some(score_sum / stats.task_count as f64);
    }

    stats
}

/// Work handed to a sub-agent: what to build, how it is judged, and where.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TaskContract {
    pub task_id: String,
    pub objective: String,
    pub model: String,
    pub criteria: Vec<String>,
    pub files: Vec<String>,
}

impl TaskContract {
    /// Builds a contract with a freshly minted `TASK-<ULID>` id.
    ///
    /// # Errors
    /// Returns [`ReputationError::Validation`] when `objective` or `model` is
    /// empty.
    pub fn for_task(
        objective: &str,
        model: &str,
        criteria: Vec<String>,
        files: Vec<String>,
    ) -> Result<Self, ReputationError> {
        if objective.trim().is_empty() {
            return Err(ReputationError::Validation(
                "objective MUST be provided for every task".to_string(),
            ));
        }

        if model.trim().is_empty() {
            return Err(ReputationError::Validation(
                "model MUST be provided for every task".to_string(),
            ));
        }

        Ok(Self {
            task_id: new_task_id(),
            objective: objective.to_string(),
            model: model.to_string(),
            criteria,
            files,
        })
    }

    #[must_use]
    pub fn agent_id(&self) -> String {
        agent_id_for_model(&self.model)
    }

    /// Renders the instructions given to the sub-agent, ending with the exact
    /// report commands it must run.
    #[must_use]
    pub fn report_instructions(&self, reporter: &str) -> String {
        let mut out = String::new();
        out.push_str(&format!("Task ID: {}\n", self.task_id));
        out.push_str(&format!("Objective: {}\n", self.objective));

        if !self.criteria.is_empty() {
            out.push_str("\nAcceptance criteria:\n");
            for criterion in &self.criteria {
                out.push_str(&format!("- {criterion}\n"));
            }
        }

        if !self.files.is_empty() {
            out.push_str("\nFiles:\n");
            for file in &self.files {
                out.push_str(&format!("- {file}\n"));
            }
        }

        out.push_str("\nWhen the work is done, report the outcome with exactly one of:\n\n");
        out.push_str(&self.report_command(reporter, "success", "<what you did>"));
        out.push('\n');
        out.push_str(&self.report_command(reporter, "blocked", "<what stopped you>"));
        out.push('\n');
        out
    }

    #[must_use]
    pub fn report_command(&self, reporter: &str, status: &str, details: &str) -> String {
        let agent_id = self.agent_id();
        [
            shell_quote(reporter),
            "--task-id".to_string(),
            shell_quote(&self.task_id),
            "--agent-id".to_string(),
            shell_quote(&agent_id),
            "--objective".to_string(),
            shell_quote(&self.objective),
            "--status".to_string(),
            shell_quote(status),
            "--details".to_string(),
            shell_quote(details),
        ]
        .join(" ")
    }
}

#[must_use]
pub fn new_task_id() -> String {
    format!("TASK-{}", Ulid::new())
}

/// Derives the reporting agent id from a `provider/model` name.
#[must_use]
pub fn agent_id_for_model(model: &str) -> String {
    model.trim().replace('/', "-").replace('.', "_")
}

/// Quotes a single word for a POSIX shell.
///
/// Words made only of safe characters pass through; anything else is wrapped in
/// single quotes, with embedded single quotes spliced as `'"'"'`.
#[must_use]
pub fn shell_quote(raw: &str) -> String {
    if raw.is_empty() {
        return "''".to_string();
    }

    let safe = raw
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || "@%+=:,./-_".contains(ch));
    if safe {
        return raw.to_string();
    }

    format!("'{}'", raw.replace('\'', "'\"'\"'"))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`ReputationError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ReputationError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ReputationError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ReputationError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ReputationError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ReputationError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            ReputationError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
