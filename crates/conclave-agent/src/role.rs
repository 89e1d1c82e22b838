use serde::{Deserialize, Serialize};

/// Specialization of an agent. Tasks name the role they need, and the
/// orchestrator routes them to an agent registered for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Orchestrator,
    Planner,
    UiBuilder,
    ApiBuilder,
    CodeGenerator,
    Verifier,
}

impl AgentRole {
    pub const ALL: [AgentRole; 6] = [
        Self::Orchestrator,
        Self::Planner,
        Self::UiBuilder,
        Self::ApiBuilder,
        Self::CodeGenerator,
        Self::Verifier,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orchestrator => "orchestrator",
            Self::Planner => "planner",
            Self::UiBuilder => "ui_builder",
            Self::ApiBuilder => "api_builder",
            Self::CodeGenerator => "code_generator",
            Self::Verifier => "verifier",
        }
    }

    /// Capabilities an agent of this role carries unless told otherwise.
    pub fn default_capabilities(&self) -> Vec<Capability> {
        let specs: &[(&str, &str)] = match self {
            Self::Orchestrator => &[
                ("coordination", "Assign work to other agents and track progress"),
                ("messaging", "Exchange messages with other agents"),
            ],
            Self::Planner => &[
                ("planning", "Break a goal into ordered tasks"),
                ("estimation", "Estimate effort and dependencies"),
            ],
            Self::UiBuilder => &[
                ("ui_design", "Lay out screens and components"),
                ("frontend_code", "Produce front-end source"),
            ],
            Self::ApiBuilder => &[
                ("api_design", "Define endpoints and payloads"),
                ("backend_code", "Produce service source"),
            ],
            Self::CodeGenerator => &[
                ("code_generation", "Generate source from a plan"),
                ("refactoring", "Restructure existing source"),
            ],
            Self::Verifier => &[
                ("testing", "Run checks against produced artifacts"),
                ("review", "Report defects found in produced artifacts"),
            ],
        };
        specs
            .iter()
            .map(|(name, description)| Capability::new(*name, *description))
            .collect()
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown agent role: {s}"))
    }
}

/// A named skill an agent advertises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Tool names backing this capability.
    #[serde(default)]
    pub tools: Vec<String>,
}

impl Capability {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            tools: vec![],
        }
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }
}
