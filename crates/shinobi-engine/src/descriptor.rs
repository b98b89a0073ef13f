//! Static descriptors loaded from JSON, and the referential checks run on
//! them before anything is built. Only references are checked (capabilities
//! and reasoning modules exist, structures are complete); persona text and
//! other content is opaque.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::coordinator::ClanConfig;
use crate::error::EngineError;
use crate::orchestrator::OrchestratorConfig;
use crate::specialist::SpecialistConfig;
use crate::workflow::{validate_steps, DojoConfig};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Descriptor {
    Specialist(SpecialistConfig),
    Orchestrator(OrchestratorConfig),
    Clan(ClanConfig),
    Dojo(DojoConfig),
}

/// Names a descriptor is allowed to reference.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Catalog {
    pub capabilities: BTreeSet<String>,
    /// `None` skips reasoning-module checks.
    pub modules: Option<BTreeSet<String>>,
}

impl Catalog {
    pub fn new<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            modules: None,
        }
    }

    #[must_use]
    pub fn with_modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.modules = Some(modules.into_iter().map(Into::into).collect());
        self
    }
}

impl Descriptor {
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        serde_json::from_str(json).map_err(|e| EngineError::invalid(format!("malformed descriptor: {e}")))
    }

    pub fn from_path(path: &Path) -> Result<Self, EngineError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| EngineError::invalid(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Specialist(_) => "specialist",
            Self::Orchestrator(_) => "orchestrator",
            Self::Clan(_) => "clan",
            Self::Dojo(_) => "dojo",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Specialist(s) => s.title.as_str(),
            Self::Orchestrator(o) => o.role.as_str(),
            Self::Clan(c) => c.name.as_str(),
            Self::Dojo(d) => d.name.as_str(),
        }
    }

    /// Every referential or structural problem, in document order.
    pub fn problems(&self, catalog: &Catalog) -> Vec<String> {
        let mut problems = Vec::new();
        match self {
            Self::Specialist(s) => check_specialist(s, &[], catalog, &mut problems),
            Self::Orchestrator(o) => check_orchestrator(o, catalog, &mut problems),
            Self::Clan(c) => check_clan(c, catalog, &mut problems),
            Self::Dojo(d) => {
                if let Err(e) = validate_steps(&d.name, &d.steps) {
                    problems.push(e.to_string());
                }
                for step in &d.steps {
                    if let Some(o) = &step.orchestrator {
                        check_orchestrator(o, catalog, &mut problems);
                    }
                    if let Some(s) = &step.specialist {
                        check_specialist(s, &[], catalog, &mut problems);
                    }
                }
            }
        }
        problems
    }

    pub fn validate(&self, catalog: &Catalog) -> Result<(), EngineError> {
        let problems = self.problems(catalog);
        if problems.is_empty() {
            Ok(())
        } else {
            Err(EngineError::invalid(problems.join("; ")))
        }
    }

    /// One line per unit, indented by nesting depth.
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        match self {
            Self::Specialist(s) => summarize_specialist(s, 0, &mut lines),
            Self::Orchestrator(o) => summarize_orchestrator(o, 0, &mut lines),
            Self::Clan(c) => {
                lines.push(format!(
                    "clan '{}' ({:?}, {} orchestrator(s))",
                    c.name,
                    c.strategy,
                    c.orchestrators.len()
                ));
                for o in &c.orchestrators {
                    summarize_orchestrator(o, 1, &mut lines);
                }
            }
            Self::Dojo(d) => {
                lines.push(format!("dojo '{}' ({:?}, {} step(s))", d.name, d.error_policy, d.steps.len()));
                for step in &d.steps {
                    lines.push(format!("  step '{}'", step.id));
                    if let Some(o) = &step.orchestrator {
                        summarize_orchestrator(o, 2, &mut lines);
                    }
                    if let Some(s) = &step.specialist {
                        summarize_specialist(s, 2, &mut lines);
                    }
                }
            }
        }
        lines.join("\n")
    }
}

fn check_specialist(s: &SpecialistConfig, shared: &[String], catalog: &Catalog, problems: &mut Vec<String>) {
    if s.title.trim().is_empty() {
        problems.push("specialist has an empty title".to_string());
    }
    if s.model.trim().is_empty() {
        problems.push(format!("specialist '{}' has no model", s.title));
    }
    let mut seen = BTreeSet::new();
    for name in &s.capabilities {
        if !seen.insert(name.as_str()) {
            problems.push(format!("specialist '{}' lists capability '{name}' twice", s.title));
        }
    }
    for name in s.capabilities.iter().chain(shared).collect::<BTreeSet<_>>() {
        if !catalog.capabilities.contains(name) {
            problems.push(format!("specialist '{}' references unknown capability '{name}'", s.title));
        }
    }
    if let (Some(module), Some(known)) = (&s.reasoning_module, &catalog.modules) {
        if !known.contains(module) {
            problems.push(format!("specialist '{}' references unknown reasoning module '{module}'", s.title));
        }
    }
}

fn check_orchestrator(o: &OrchestratorConfig, catalog: &Catalog, problems: &mut Vec<String>) {
    if o.specialists.is_empty() {
        problems.push(format!("orchestrator '{}' has no specialists", o.role));
    }
    for s in &o.specialists {
        check_specialist(s, &o.capabilities, catalog, problems);
    }
}

fn check_clan(c: &ClanConfig, catalog: &Catalog, problems: &mut Vec<String>) {
    if c.orchestrators.is_empty() {
        problems.push(format!("clan '{}' has no orchestrators", c.name));
    }
    if c.max_concurrency == Some(0) {
        problems.push(format!("clan '{}' max_concurrency must be at least 1", c.name));
    }
    for o in &c.orchestrators {
        check_orchestrator(o, catalog, problems);
    }
}

fn summarize_specialist(s: &SpecialistConfig, depth: usize, lines: &mut Vec<String>) {
    let indent = "  ".repeat(depth);
    let caps = if s.capabilities.is_empty() {
        "no capabilities".to_string()
    } else {
        s.capabilities.join(", ")
    };
    lines.push(format!("{indent}specialist '{}' [{}] ({caps})", s.title, s.model));
}

fn summarize_orchestrator(o: &OrchestratorConfig, depth: usize, lines: &mut Vec<String>) {
    let indent = "  ".repeat(depth);
    lines.push(format!(
        "{indent}orchestrator '{}' ({} specialist(s), {:?} on failure)",
        o.role,
        o.specialists.len(),
        o.failure_policy
    ));
    for s in &o.specialists {
        summarize_specialist(s, depth + 1, lines);
    }
}
