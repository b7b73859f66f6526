use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Kind of work a task represents. Closed enumeration: workers declare which
/// kinds they accept and the dispatcher matches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    EvidenceCollection,
    SecurityScan,
    RiskAssessment,
    PolicyAnalysis,
    ComplianceCheck,
    ReportGeneration,
    DataValidation,
    PredictiveAnalysis,
    WorkflowOrchestration,
    CryptoVerification,
}

impl TaskKind {
    /// All kinds, in declaration order.
    pub const ALL: [TaskKind; 10] = [
        Self::EvidenceCollection,
        Self::SecurityScan,
        Self::RiskAssessment,
        Self::PolicyAnalysis,
        Self::ComplianceCheck,
        Self::ReportGeneration,
        Self::DataValidation,
        Self::PredictiveAnalysis,
        Self::WorkflowOrchestration,
        Self::CryptoVerification,
    ];
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::EvidenceCollection => "evidence_collection",
            Self::SecurityScan => "security_scan",
            Self::RiskAssessment => "risk_assessment",
            Self::PolicyAnalysis => "policy_analysis",
            Self::ComplianceCheck => "compliance_check",
            Self::ReportGeneration => "report_generation",
            Self::DataValidation => "data_validation",
            Self::PredictiveAnalysis => "predictive_analysis",
            Self::WorkflowOrchestration => "workflow_orchestration",
            Self::CryptoVerification => "crypto_verification",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskKind {
    type Err = TaskKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "evidence_collection" => Ok(Self::EvidenceCollection),
            "security_scan" => Ok(Self::SecurityScan),
            "risk_assessment" => Ok(Self::RiskAssessment),
            "policy_analysis" => Ok(Self::PolicyAnalysis),
            "compliance_check" => Ok(Self::ComplianceCheck),
            "report_generation" => Ok(Self::ReportGeneration),
            "data_validation" => Ok(Self::DataValidation),
            "predictive_analysis" => Ok(Self::PredictiveAnalysis),
            "workflow_orchestration" => Ok(Self::WorkflowOrchestration),
            "crypto_verification" => Ok(Self::CryptoVerification),
            other => Err(TaskKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskKind`] string.
#[derive(Debug, Clone)]
pub struct TaskKindParseError(pub String);

impl fmt::Display for TaskKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task kind: {:?}", self.0)
    }
}

impl std::error::Error for TaskKindParseError {}

// ---------------------------------------------------------------------------

/// Task priority. Lower numeric value dispatches first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical,
    High,
    Medium,
    Low,
    Background,
}

impl TaskPriority {
    /// All priorities, highest first.
    pub const ALL: [TaskPriority; 5] = [
        Self::Critical,
        Self::High,
        Self::Medium,
        Self::Low,
        Self::Background,
    ];

    /// Numeric rank used for queue ordering (critical = 1).
    pub fn rank(self) -> i16 {
        match self {
            Self::Critical => 1,
            Self::High => 2,
            Self::Medium => 3,
            Self::Low => 4,
            Self::Background => 5,
        }
    }

    pub fn from_rank(rank: i16) -> Option<Self> {
        match rank {
            1 => Some(Self::Critical),
            2 => Some(Self::High),
            3 => Some(Self::Medium),
            4 => Some(Self::Low),
            5 => Some(Self::Background),
            _ => None,
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Medium
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Background => "background",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskPriority {
    type Err = TaskPriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            "background" => Ok(Self::Background),
            other => Err(TaskPriorityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskPriority`] string.
#[derive(Debug, Clone)]
pub struct TaskPriorityParseError(pub String);

impl fmt::Display for TaskPriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task priority: {:?}", self.0)
    }
}

impl std::error::Error for TaskPriorityParseError {}

// ---------------------------------------------------------------------------

/// Status of a task.
///
/// `completed`, `failed`, and `cancelled` are terminal. `timeout` is a
/// transient terminal: it carries a `completed_at` timestamp but re-enters
/// the retry pipeline as a retriable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Assigned,
    WaitingDeps,
    Running,
    Completed,
    Failed,
    Retrying,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    /// True for states that admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States in which a worker instance is associated with the task.
    pub fn holds_worker(self) -> bool {
        matches!(self, Self::Assigned | Self::Running | Self::Timeout)
    }

    /// States that carry a `completed_at` timestamp.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    /// Check whether `self -> to` is a valid edge in the task state graph.
    ///
    /// ```text
    /// pending      -> queued | waiting_deps
    /// waiting_deps -> pending
    /// queued       -> assigned
    /// assigned     -> running
    /// running      -> completed | retrying | failed | timeout
    /// timeout      -> retrying | failed
    /// retrying     -> queued
    /// any non-terminal -> cancelled
    /// ```
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        if to == Self::Cancelled {
            return !self.is_terminal();
        }
        matches!(
            (self, to),
            (Self::Pending, Self::Queued)
                | (Self::Pending, Self::WaitingDeps)
                | (Self::WaitingDeps, Self::Pending)
                | (Self::Queued, Self::Assigned)
                | (Self::Assigned, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Retrying)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Timeout)
                | (Self::Timeout, Self::Retrying)
                | (Self::Timeout, Self::Failed)
                | (Self::Retrying, Self::Queued)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::WaitingDeps => "waiting_deps",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "assigned" => Ok(Self::Assigned),
            "waiting_deps" => Ok(Self::WaitingDeps),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            "cancelled" => Ok(Self::Cancelled),
            "timeout" => Ok(Self::Timeout),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Classification of a worker-reported failure. Tags, not types: the retry
/// engine decides eligibility from the tag plus per-task retry config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorTag {
    Transient,
    Timeout,
    ResourceExhausted,
    InvalidInput,
    PermissionDenied,
    NotFound,
    DependencyFailed,
    Internal,
}

impl ErrorTag {
    /// Default retriability when no explicit retry-on / skip-on policy
    /// applies.
    pub fn retriable_by_default(self) -> bool {
        matches!(
            self,
            Self::Transient | Self::Timeout | Self::ResourceExhausted | Self::Internal
        )
    }
}

impl fmt::Display for ErrorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::ResourceExhausted => "resource_exhausted",
            Self::InvalidInput => "invalid_input",
            Self::PermissionDenied => "permission_denied",
            Self::NotFound => "not_found",
            Self::DependencyFailed => "dependency_failed",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl FromStr for ErrorTag {
    type Err = ErrorTagParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(Self::Transient),
            "timeout" => Ok(Self::Timeout),
            "resource_exhausted" => Ok(Self::ResourceExhausted),
            "invalid_input" => Ok(Self::InvalidInput),
            "permission_denied" => Ok(Self::PermissionDenied),
            "not_found" => Ok(Self::NotFound),
            "dependency_failed" => Ok(Self::DependencyFailed),
            "internal" => Ok(Self::Internal),
            other => Err(ErrorTagParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ErrorTag`] string.
#[derive(Debug, Clone)]
pub struct ErrorTagParseError(pub String);

impl fmt::Display for ErrorTagParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid error tag: {:?}", self.0)
    }
}

impl std::error::Error for ErrorTagParseError {}

// ---------------------------------------------------------------------------

/// Backoff strategy used when rescheduling a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Immediate,
    LinearBackoff,
    ExpBackoff,
    FibonacciBackoff,
    Adaptive,
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Immediate => "immediate",
            Self::LinearBackoff => "linear_backoff",
            Self::ExpBackoff => "exp_backoff",
            Self::FibonacciBackoff => "fibonacci_backoff",
            Self::Adaptive => "adaptive",
        };
        f.write_str(s)
    }
}

impl FromStr for RetryStrategy {
    type Err = RetryStrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(Self::Immediate),
            "linear_backoff" => Ok(Self::LinearBackoff),
            "exp_backoff" => Ok(Self::ExpBackoff),
            "fibonacci_backoff" => Ok(Self::FibonacciBackoff),
            "adaptive" => Ok(Self::Adaptive),
            other => Err(RetryStrategyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RetryStrategy`] string.
#[derive(Debug, Clone)]
pub struct RetryStrategyParseError(pub String);

impl fmt::Display for RetryStrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid retry strategy: {:?}", self.0)
    }
}

impl std::error::Error for RetryStrategyParseError {}

// ---------------------------------------------------------------------------

/// How a recurring task's next run is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Continuous,
    Interval,
    Daily,
    Weekly,
    Monthly,
    Custom,
    Adaptive,
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Continuous => "continuous",
            Self::Interval => "interval",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Custom => "custom",
            Self::Adaptive => "adaptive",
        };
        f.write_str(s)
    }
}

impl FromStr for ScheduleKind {
    type Err = ScheduleKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "continuous" => Ok(Self::Continuous),
            "interval" => Ok(Self::Interval),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "custom" => Ok(Self::Custom),
            "adaptive" => Ok(Self::Adaptive),
            other => Err(ScheduleKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ScheduleKind`] string.
#[derive(Debug, Clone)]
pub struct ScheduleKindParseError(pub String);

impl fmt::Display for ScheduleKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid schedule kind: {:?}", self.0)
    }
}

impl std::error::Error for ScheduleKindParseError {}

// ---------------------------------------------------------------------------

/// Health of a worker instance, derived from heartbeat recency and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkerHealth {
    type Err = WorkerHealthParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(Self::Healthy),
            "degraded" => Ok(Self::Degraded),
            "unhealthy" => Ok(Self::Unhealthy),
            other => Err(WorkerHealthParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorkerHealth`] string.
#[derive(Debug, Clone)]
pub struct WorkerHealthParseError(pub String);

impl fmt::Display for WorkerHealthParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid worker health: {:?}", self.0)
    }
}

impl std::error::Error for WorkerHealthParseError {}

// ---------------------------------------------------------------------------
// Config records embedded in tasks
// ---------------------------------------------------------------------------

/// A local-time interval during which a task must not be dispatched.
///
/// `start > end` means the window crosses midnight and excludes
/// `[start, 24:00) ∪ [00:00, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlackoutWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl BlackoutWindow {
    /// True when `time` falls inside the window.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= time && time <= self.end
        } else {
            time >= self.start || time <= self.end
        }
    }
}

/// Recurrence and gating configuration attached to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub kind: ScheduleKind,
    #[serde(default)]
    pub interval_minutes: Option<u32>,
    /// Local times-of-day for daily/weekly/monthly schedules.
    #[serde(default)]
    pub specific_times: Vec<NaiveTime>,
    /// Days of week for weekly schedules.
    #[serde(default)]
    pub days_of_week: Vec<Weekday>,
    /// IANA zone name the blackout windows and specific times are
    /// interpreted in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub blackout_windows: Vec<BlackoutWindow>,
    /// Minimum percentage of CPU that must be available to dispatch.
    #[serde(default)]
    pub min_cpu_available: Option<f64>,
    /// Minimum percentage of memory that must be available to dispatch.
    #[serde(default)]
    pub min_memory_available: Option<f64>,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Cap on concurrently running tasks of the owning worker kind.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
}

fn default_timezone() -> String {
    "UTC".to_owned()
}

fn default_max_concurrent() -> u32 {
    1
}

impl ScheduleConfig {
    /// A one-shot placeholder config carrying only blackout windows.
    pub fn custom() -> Self {
        Self {
            kind: ScheduleKind::Custom,
            interval_minutes: None,
            specific_times: Vec::new(),
            days_of_week: Vec::new(),
            timezone: default_timezone(),
            blackout_windows: Vec::new(),
            min_cpu_available: None,
            min_memory_available: None,
            priority: TaskPriority::default(),
            max_concurrent: default_max_concurrent(),
        }
    }

    /// True when this schedule produces follow-up runs after completion.
    pub fn is_recurring(&self) -> bool {
        !matches!(self.kind, ScheduleKind::Custom)
    }
}

/// Retry behavior attached to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub strategy: RetryStrategy,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    /// Allow-list: when non-empty, only these tags are retried.
    #[serde(default)]
    pub retry_on: Vec<ErrorTag>,
    /// Deny-list: these tags are never retried.
    #[serde(default)]
    pub skip_on: Vec<ErrorTag>,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> u64 {
    60
}

fn default_max_delay() -> u64 {
    3600
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::ExpBackoff,
            max_attempts: default_max_attempts(),
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
            backoff_factor: default_backoff_factor(),
            jitter: default_jitter(),
            retry_on: Vec::new(),
            skip_on: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Task record
// ---------------------------------------------------------------------------

/// A durable unit of work.
///
/// Owned exclusively by the orchestrator; every other component reads
/// snapshots. Mutations go through [`crate::TaskStore::transition`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub kind: TaskKind,
    pub priority: TaskPriority,
    /// Optional routing preference: restrict candidates to this worker kind.
    pub target_worker_kind: Option<String>,
    pub tenant_id: String,
    pub submitted_by: String,
    pub payload: serde_json::Value,
    pub configuration: serde_json::Value,
    /// Task ids that must complete before this task is eligible.
    pub dependencies: Vec<Uuid>,
    pub status: TaskStatus,
    pub assigned_worker: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_tag: Option<ErrorTag>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub estimated_duration_secs: f64,
    pub actual_duration_secs: Option<f64>,
    pub correlation_id: Option<String>,
    /// Future time before which the task must not run.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Recurrence / blackout / resource-gate configuration.
    pub schedule: Option<ScheduleConfig>,
    /// Retry policy; the orchestrator default applies when absent.
    pub retry_policy: Option<RetryConfig>,
    /// Per-task execution timeout override, in seconds.
    pub timeout_secs: Option<u64>,
}

impl Task {
    /// Create a fresh pending task with defaults; callers fill in the rest
    /// with struct-field assignment.
    pub fn new(kind: TaskKind, priority: TaskPriority, tenant_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            priority,
            target_worker_kind: None,
            tenant_id: tenant_id.into(),
            submitted_by: String::new(),
            payload: serde_json::Value::Object(serde_json::Map::new()),
            configuration: serde_json::Value::Object(serde_json::Map::new()),
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            assigned_worker: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
            error_tag: None,
            retry_count: 0,
            max_retries: 3,
            estimated_duration_secs: 60.0,
            actual_duration_secs: None,
            correlation_id: None,
            scheduled_at: None,
            schedule: None,
            retry_policy: None,
            timeout_secs: None,
        }
    }
}

/// A claimable entry in a priority queue: (priority, ready_at, seq) ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedEntry {
    pub task_id: Uuid,
    pub priority: TaskPriority,
    pub ready_at: DateTime<Utc>,
    /// Monotonic submission order within the store; breaks ready_at ties.
    pub seq: i64,
}

/// A task that terminated in `failed` and was parked for operator action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub task: Task,
    pub moved_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
