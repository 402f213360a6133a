//! Agent catalog
//!
//! Every unit of pipeline work is a named agent. This module is the single
//! source of truth for agent names, their phases, prerequisites and the
//! artifact files they are expected to produce.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Directory (relative to the workspace) holding agent artifacts
pub const DELIVERABLES_DIR: &str = "deliverables";

/// Final report produced by the reporting phase
pub const REPORT_FILE: &str = "comprehensive_security_assessment_report.md";

/// Vulnerability class handled by one vuln→exploit sub-pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VulnType {
    Injection,
    Xss,
    Auth,
    Ssrf,
    Authz,
}

impl VulnType {
    pub const ALL: [VulnType; 5] = [
        VulnType::Injection,
        VulnType::Xss,
        VulnType::Auth,
        VulnType::Ssrf,
        VulnType::Authz,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VulnType::Injection => "injection",
            VulnType::Xss => "xss",
            VulnType::Auth => "auth",
            VulnType::Ssrf => "ssrf",
            VulnType::Authz => "authz",
        }
    }

    pub fn vuln_agent(&self) -> AgentName {
        match self {
            VulnType::Injection => AgentName::InjectionVuln,
            VulnType::Xss => AgentName::XssVuln,
            VulnType::Auth => AgentName::AuthVuln,
            VulnType::Ssrf => AgentName::SsrfVuln,
            VulnType::Authz => AgentName::AuthzVuln,
        }
    }

    pub fn exploit_agent(&self) -> AgentName {
        match self {
            VulnType::Injection => AgentName::InjectionExploit,
            VulnType::Xss => AgentName::XssExploit,
            VulnType::Auth => AgentName::AuthExploit,
            VulnType::Ssrf => AgentName::SsrfExploit,
            VulnType::Authz => AgentName::AuthzExploit,
        }
    }

    /// `deliverables/<type>_analysis_deliverable.md`
    pub fn deliverable_path(&self, workspace: &Path) -> PathBuf {
        workspace
            .join(DELIVERABLES_DIR)
            .join(format!("{}_analysis_deliverable.md", self.as_str()))
    }

    /// `deliverables/<type>_exploitation_queue.json`
    pub fn queue_path(&self, workspace: &Path) -> PathBuf {
        workspace
            .join(DELIVERABLES_DIR)
            .join(format!("{}_exploitation_queue.json", self.as_str()))
    }

    /// `deliverables/<type>_exploitation_evidence.md`
    pub fn evidence_path(&self, workspace: &Path) -> PathBuf {
        workspace
            .join(DELIVERABLES_DIR)
            .join(format!("{}_exploitation_evidence.md", self.as_str()))
    }
}

impl fmt::Display for VulnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase used for metric aggregation and progress reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseName {
    PreRecon,
    Recon,
    VulnerabilityAnalysis,
    Exploitation,
    Reporting,
}

impl PhaseName {
    pub const ALL: [PhaseName; 5] = [
        PhaseName::PreRecon,
        PhaseName::Recon,
        PhaseName::VulnerabilityAnalysis,
        PhaseName::Exploitation,
        PhaseName::Reporting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::PreRecon => "pre-recon",
            PhaseName::Recon => "recon",
            PhaseName::VulnerabilityAnalysis => "vulnerability-analysis",
            PhaseName::Exploitation => "exploitation",
            PhaseName::Reporting => "reporting",
        }
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named unit of pipeline work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentName {
    PreRecon,
    Recon,
    InjectionVuln,
    XssVuln,
    AuthVuln,
    SsrfVuln,
    AuthzVuln,
    InjectionExploit,
    XssExploit,
    AuthExploit,
    SsrfExploit,
    AuthzExploit,
    Report,
}

impl AgentName {
    /// Canonical execution order
    pub const ALL: [AgentName; 13] = [
        AgentName::PreRecon,
        AgentName::Recon,
        AgentName::InjectionVuln,
        AgentName::XssVuln,
        AgentName::AuthVuln,
        AgentName::SsrfVuln,
        AgentName::AuthzVuln,
        AgentName::InjectionExploit,
        AgentName::XssExploit,
        AgentName::AuthExploit,
        AgentName::SsrfExploit,
        AgentName::AuthzExploit,
        AgentName::Report,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentName::PreRecon => "pre-recon",
            AgentName::Recon => "recon",
            AgentName::InjectionVuln => "injection-vuln",
            AgentName::XssVuln => "xss-vuln",
            AgentName::AuthVuln => "auth-vuln",
            AgentName::SsrfVuln => "ssrf-vuln",
            AgentName::AuthzVuln => "authz-vuln",
            AgentName::InjectionExploit => "injection-exploit",
            AgentName::XssExploit => "xss-exploit",
            AgentName::AuthExploit => "auth-exploit",
            AgentName::SsrfExploit => "ssrf-exploit",
            AgentName::AuthzExploit => "authz-exploit",
            AgentName::Report => "report",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            AgentName::PreRecon => "Pre-recon agent",
            AgentName::Recon => "Recon agent",
            AgentName::InjectionVuln => "Injection vuln agent",
            AgentName::XssVuln => "XSS vuln agent",
            AgentName::AuthVuln => "Auth vuln agent",
            AgentName::SsrfVuln => "SSRF vuln agent",
            AgentName::AuthzVuln => "Authz vuln agent",
            AgentName::InjectionExploit => "Injection exploit agent",
            AgentName::XssExploit => "XSS exploit agent",
            AgentName::AuthExploit => "Auth exploit agent",
            AgentName::SsrfExploit => "SSRF exploit agent",
            AgentName::AuthzExploit => "Authz exploit agent",
            AgentName::Report => "Report agent",
        }
    }

    /// Task description handed to the runner (resolved to a prompt externally)
    pub fn prompt_name(&self) -> &'static str {
        match self {
            AgentName::PreRecon => "pre-recon-code",
            AgentName::Recon => "recon",
            AgentName::InjectionVuln => "vuln-injection",
            AgentName::XssVuln => "vuln-xss",
            AgentName::AuthVuln => "vuln-auth",
            AgentName::SsrfVuln => "vuln-ssrf",
            AgentName::AuthzVuln => "vuln-authz",
            AgentName::InjectionExploit => "exploit-injection",
            AgentName::XssExploit => "exploit-xss",
            AgentName::AuthExploit => "exploit-auth",
            AgentName::SsrfExploit => "exploit-ssrf",
            AgentName::AuthzExploit => "exploit-authz",
            AgentName::Report => "report-executive",
        }
    }

    /// Phase this agent's metrics roll up into
    pub fn phase(&self) -> PhaseName {
        match self {
            AgentName::PreRecon => PhaseName::PreRecon,
            AgentName::Recon => PhaseName::Recon,
            AgentName::InjectionVuln
            | AgentName::XssVuln
            | AgentName::AuthVuln
            | AgentName::SsrfVuln
            | AgentName::AuthzVuln => PhaseName::VulnerabilityAnalysis,
            AgentName::InjectionExploit
            | AgentName::XssExploit
            | AgentName::AuthExploit
            | AgentName::SsrfExploit
            | AgentName::AuthzExploit => PhaseName::Exploitation,
            AgentName::Report => PhaseName::Reporting,
        }
    }

    pub fn prerequisites(&self) -> Vec<AgentName> {
        match self {
            AgentName::PreRecon => vec![],
            AgentName::Recon => vec![AgentName::PreRecon],
            AgentName::InjectionVuln
            | AgentName::XssVuln
            | AgentName::AuthVuln
            | AgentName::SsrfVuln
            | AgentName::AuthzVuln => vec![AgentName::Recon],
            AgentName::Report => VulnType::ALL.iter().map(|v| v.exploit_agent()).collect(),
            exploit => match exploit.vuln_type() {
                Some(vuln) => vec![vuln.vuln_agent()],
                None => vec![],
            },
        }
    }

    /// Vulnerability class for vuln/exploit agents
    pub fn vuln_type(&self) -> Option<VulnType> {
        match self {
            AgentName::InjectionVuln | AgentName::InjectionExploit => Some(VulnType::Injection),
            AgentName::XssVuln | AgentName::XssExploit => Some(VulnType::Xss),
            AgentName::AuthVuln | AgentName::AuthExploit => Some(VulnType::Auth),
            AgentName::SsrfVuln | AgentName::SsrfExploit => Some(VulnType::Ssrf),
            AgentName::AuthzVuln | AgentName::AuthzExploit => Some(VulnType::Authz),
            AgentName::PreRecon | AgentName::Recon | AgentName::Report => None,
        }
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentName::ALL
            .iter()
            .copied()
            .find(|agent| agent.as_str() == s)
            .ok_or_else(|| format!("unknown agent: {}", s))
    }
}
