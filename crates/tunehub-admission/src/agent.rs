//! User-Agent classification.

use std::fmt;

use crate::config::UserAgentConfig;

/// Why an agent was classified the way it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentReason {
    /// No deny-list token matched.
    Clean,
    /// The header was missing or blank.
    Missing,
    /// The header contained a deny-list token.
    Token(String),
}

impl fmt::Display for AgentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => f.write_str("clean"),
            Self::Missing => f.write_str("missing user-agent"),
            Self::Token(token) => write!(f, "matched token {token:?}"),
        }
    }
}

/// Classification result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentVerdict {
    /// Whether the agent looks automated.
    pub suspicious: bool,
    /// Explanation for the decision.
    pub reason: AgentReason,
}

/// Stateless deny-list matcher over User-Agent strings.
#[derive(Debug, Clone)]
pub struct UserAgentClassifier {
    /// Lowercased tokens.
    tokens: Vec<String>,
    block_empty: bool,
}

impl UserAgentClassifier {
    /// Create from configuration.
    #[must_use]
    pub fn from_config(config: &UserAgentConfig) -> Self {
        Self {
            tokens: config
                .suspicious_tokens
                .iter()
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            block_empty: config.block_empty,
        }
    }

    /// Classify a User-Agent header value (`None` when absent).
    #[must_use]
    pub fn classify(&self, user_agent: Option<&str>) -> AgentVerdict {
        let ua = user_agent.map(str::trim).unwrap_or_default();
        if ua.is_empty() {
            return AgentVerdict {
                suspicious: self.block_empty,
                reason: AgentReason::Missing,
            };
        }

        let lowered = ua.to_ascii_lowercase();
        match self.tokens.iter().find(|t| lowered.contains(t.as_str())) {
            Some(token) => AgentVerdict {
                suspicious: true,
                reason: AgentReason::Token(token.clone()),
            },
            None => AgentVerdict {
                suspicious: false,
                reason: AgentReason::Clean,
            },
        }
    }
}

impl Default for UserAgentClassifier {
    fn default() -> Self {
        Self::from_config(&UserAgentConfig::default())
    }
}
