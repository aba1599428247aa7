use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TransactionRecord
// ---------------------------------------------------------------------------

/// One marketplace sale, normalized. Identity is `(time, amount, tx_type)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Authoritative ordering key. `None` when no timestamp in the entry parses.
    pub date: Option<DateTime<Utc>>,
    /// Raw timestamp string as delivered by the source.
    pub time: String,
    /// Source page; 0 when the caller did not supply one. Informational only.
    pub page_number: u32,
    /// `YYYYMMDD` grouping key.
    pub batch_number: u32,
    /// Raw integer-like amount, kept verbatim.
    pub amount: String,
    /// `amount / 10^6` for valid positive amounts, otherwise 0.
    pub price: f64,
    #[serde(rename = "type")]
    pub tx_type: String,
    pub agent_kind: AgentKind,
    pub from_address: String,
    pub to_address: String,
    pub name: String,
}

impl TransactionRecord {
    /// Value written to the `date` column. Fixed-width UTC so text order is
    /// chronological order.
    pub fn date_column(&self) -> Option<String> {
        self.date.map(format_date_column)
    }

    /// Required-field check applied by storage before insert.
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.time.trim().is_empty() {
            return Err("missing time");
        }
        if self.amount.trim().is_empty() {
            return Err("missing amount");
        }
        Ok(())
    }
}

pub fn format_date_column(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Micro-units → price. Anything that is not a positive integer prices at 0.
pub fn price_from_amount(amount: &str) -> f64 {
    match amount.trim().parse::<u128>() {
        Ok(units) if units > 0 => units as f64 / 1_000_000.0,
        _ => 0.0,
    }
}

// ---------------------------------------------------------------------------
// AgentKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Sale routed through an automated machine address.
    Machine,
    Human,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Machine => "machine",
            AgentKind::Human => "human",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Run options
// ---------------------------------------------------------------------------

/// Which way the date locator walks the page space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SearchDirection {
    /// Start at page 1 and move toward older pages.
    Forward,
    /// Start at a high page and move toward page 1.
    Backward,
}

impl std::fmt::Display for SearchDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchDirection::Forward => write!(f, "forward"),
            SearchDirection::Backward => write!(f, "backward"),
        }
    }
}

/// Order in which a harvest walks pages. The source serves newest sales on page 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum HarvestDirection {
    /// Ascending page numbers: newest sales first.
    NewestFirst,
    /// Descending page numbers: oldest sales first.
    OldestFirst,
}

impl std::fmt::Display for HarvestDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HarvestDirection::NewestFirst => write!(f, "newest_first"),
            HarvestDirection::OldestFirst => write!(f, "oldest_first"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    /// Skip pages that already carry a completion marker.
    Markers,
    /// Locate the edge of the stored date range and continue past it.
    Date,
    /// Ignore completion markers.
    Fresh,
}

impl std::fmt::Display for ResumeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResumeMode::Markers => write!(f, "markers"),
            ResumeMode::Date => write!(f, "date"),
            ResumeMode::Fresh => write!(f, "fresh"),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub inserted: u64,
    pub skipped_duplicate: u64,
    pub rejected_invalid: u64,
}

impl WriteOutcome {
    pub fn total(&self) -> u64 {
        self.inserted + self.skipped_duplicate + self.rejected_invalid
    }
}

impl std::ops::AddAssign for WriteOutcome {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.skipped_duplicate += rhs.skipped_duplicate;
        self.rejected_invalid += rhs.rejected_invalid;
    }
}

// ---------------------------------------------------------------------------
// Harvest lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestPhase {
    #[default]
    Idle,
    Resuming,
    Harvesting,
    Flushing,
    Cancelling,
    Completed,
    /// Terminal state for a fatal-for-run error.
    Failed,
}

impl HarvestPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HarvestPhase::Completed | HarvestPhase::Failed)
    }

    pub fn can_transition_to(&self, next: HarvestPhase) -> bool {
        use HarvestPhase::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Cancelling) | (_, Failed) => true,
            (Idle, Resuming) => true,
            (Resuming, Harvesting) | (Resuming, Completed) => true,
            (Harvesting, Flushing) | (Flushing, Harvesting) => true,
            (Harvesting, Completed) | (Flushing, Completed) => true,
            (Cancelling, Completed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for HarvestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HarvestPhase::Idle => "idle",
            HarvestPhase::Resuming => "resuming",
            HarvestPhase::Harvesting => "harvesting",
            HarvestPhase::Flushing => "flushing",
            HarvestPhase::Cancelling => "cancelling",
            HarvestPhase::Completed => "completed",
            HarvestPhase::Failed => "failed",
        };
        write!(f, "{s}")
    }
}
