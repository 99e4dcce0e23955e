//! Good/bad-flow signals.
//!
//! An external classifier reports a flow as good (bypass the sensors) or
//! bad (drop). A signal installs a forward/reverse rule pair in the owning
//! domain and is remembered in the whitelist or blacklist until the rules
//! expire or are removed.

use std::fmt;

use serde::{Deserialize, Serialize};

use scipass_core::prefix::Prefix;
use scipass_core::types::{FlowMatch, ForwardingRule};

use crate::error::CoordinatorError;

/// Flow descriptor as sent by the classifier.
///
/// ```json
/// {"nw_src": "10.0.20.2/32", "nw_dst": "156.56.6.1/32", "tp_src": 1, "tp_dst": 2}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSignal {
    pub nw_src: String,
    pub nw_dst: String,
    #[serde(default)]
    pub tp_src: Option<u16>,
    #[serde(default)]
    pub tp_dst: Option<u16>,
    /// Overrides the domain's default idle timeout
    #[serde(default)]
    pub idle_timeout: Option<u16>,
    /// Overrides the domain's default hard timeout
    #[serde(default)]
    pub hard_timeout: Option<u16>,
    /// Overrides the domain's whitelist/blacklist priority
    #[serde(default)]
    pub priority: Option<u32>,
}

impl FlowSignal {
    pub fn new(nw_src: impl Into<String>, nw_dst: impl Into<String>) -> Self {
        Self {
            nw_src: nw_src.into(),
            nw_dst: nw_dst.into(),
            tp_src: None,
            tp_dst: None,
            idle_timeout: None,
            hard_timeout: None,
            priority: None,
        }
    }

    pub fn with_ports(mut self, tp_src: u16, tp_dst: u16) -> Self {
        self.tp_src = Some(tp_src);
        self.tp_dst = Some(tp_dst);
        self
    }

    pub fn parse_json(input: &str) -> Result<Self, CoordinatorError> {
        serde_json::from_str(input).map_err(|e| CoordinatorError::InvalidSignal(e.to_string()))
    }

    pub fn src(&self) -> Result<Prefix, CoordinatorError> {
        parse_end("nw_src", &self.nw_src)
    }

    pub fn dst(&self) -> Result<Prefix, CoordinatorError> {
        parse_end("nw_dst", &self.nw_dst)
    }

    /// Match for the flow as described, without an input port.
    pub fn header(&self) -> Result<FlowMatch, CoordinatorError> {
        let (src, dst) = (self.src()?, self.dst()?);
        if src.family() != dst.family() {
            return Err(CoordinatorError::InvalidSignal(format!(
                "mixed address families: {src} -> {dst}"
            )));
        }
        Ok(FlowMatch::default()
            .with_src(src)
            .with_dst(dst)
            .with_transport(self.tp_src, self.tp_dst))
    }
}

impl fmt::Display for FlowSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.nw_src)?;
        if let Some(tp) = self.tp_src {
            write!(f, ":{tp}")?;
        }
        write!(f, " -> {}", self.nw_dst)?;
        if let Some(tp) = self.tp_dst {
            write!(f, ":{tp}")?;
        }
        Ok(())
    }
}

fn parse_end(field: &str, value: &str) -> Result<Prefix, CoordinatorError> {
    value
        .parse()
        .map_err(|e| CoordinatorError::InvalidSignal(format!("{field}: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Good,
    Bad,
}

impl Verdict {
    pub fn label(self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Bad => "bad",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Reply to a signal: `{success, reason?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SignalOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
        }
    }
}

impl From<Result<(), CoordinatorError>> for SignalOutcome {
    fn from(result: Result<(), CoordinatorError>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => Self::failed(e.to_string()),
        }
    }
}

/// One rule installed for a signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignaledFlow {
    pub domain: String,
    pub rule: ForwardingRule,
}

/// Whitelist and blacklist of one domain.
#[derive(Debug, Clone, Default)]
pub struct SignalRegistry {
    whitelist: Vec<SignaledFlow>,
    blacklist: Vec<SignaledFlow>,
}

impl SignalRegistry {
    pub fn record(&mut self, verdict: Verdict, flow: SignaledFlow) {
        let list = self.list_mut(verdict);
        list.retain(|f| !f.rule.same_entry(&flow.rule.flow_match, flow.rule.priority));
        list.push(flow);
    }

    pub fn list(&self, verdict: Verdict) -> &[SignaledFlow] {
        match verdict {
            Verdict::Good => &self.whitelist,
            Verdict::Bad => &self.blacklist,
        }
    }

    fn list_mut(&mut self, verdict: Verdict) -> &mut Vec<SignaledFlow> {
        match verdict {
            Verdict::Good => &mut self.whitelist,
            Verdict::Bad => &mut self.blacklist,
        }
    }

    /// Drops the entry for this rule from whichever list holds it.
    pub fn remove(&mut self, flow_match: &FlowMatch, priority: u32) -> Option<Verdict> {
        for verdict in [Verdict::Good, Verdict::Bad] {
            let list = self.list_mut(verdict);
            let before = list.len();
            list.retain(|f| !f.rule.same_entry(flow_match, priority));
            if list.len() != before {
                return Some(verdict);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.whitelist.len() + self.blacklist.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.whitelist.clear();
        self.blacklist.clear();
    }
}
