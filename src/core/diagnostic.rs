//! Diagnostics collected while analyzing code.
//!
//! Nothing found during analysis aborts a run. Each problem becomes a
//! [`Diagnostic`] with a location, a severity, a code and a message template
//! with positional arguments. Presentation layers sort and filter the
//! [`ErrorCollection`] as they see fit.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::address::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
    Message,
}

impl Severity {
    pub fn as_str(&self) -> &str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Message => "message",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    OutOfImage,
    RanIntoData,
    RanIntoCode,
    OverlappingInstruction,
    AddressWrapped,
    InvalidInstruction,
    BrokenFixup,
    InconsistentCall,
    DynamicTarget,
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::OutOfImage => "OutOfImage",
            ErrorCode::RanIntoData => "RanIntoData",
            ErrorCode::RanIntoCode => "RanIntoCode",
            ErrorCode::OverlappingInstruction => "OverlappingInstruction",
            ErrorCode::AddressWrapped => "AddressWrapped",
            ErrorCode::InvalidInstruction => "InvalidInstruction",
            ErrorCode::BrokenFixup => "BrokenFixup",
            ErrorCode::InconsistentCall => "InconsistentCall",
            ErrorCode::DynamicTarget => "DynamicTarget",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Where the problem was found, if it has a location at all
    pub location: Option<Address>,
    pub severity: Severity,
    pub code: ErrorCode,
    /// Message with `{0}`, `{1}`... placeholders
    pub template: String,
    pub args: Vec<String>,
}

impl Diagnostic {
    pub fn new(
        location: Option<Address>,
        severity: Severity,
        code: ErrorCode,
        template: &str,
        args: Vec<String>,
    ) -> Self {
        Self {
            location,
            severity,
            code,
            template: template.to_string(),
            args,
        }
    }

    pub fn error(location: Option<Address>, code: ErrorCode, template: &str) -> Self {
        Self::new(location, Severity::Error, code, template, Vec::new())
    }

    pub fn with_arg(mut self, arg: impl fmt::Display) -> Self {
        self.args.push(arg.to_string());
        self
    }

    /// Template with positional arguments substituted.
    pub fn message(&self) -> String {
        let mut out = self.template.clone();
        for (i, arg) in self.args.iter().enumerate() {
            out = out.replace(&format!("{{{}}}", i), arg);
        }
        out
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location {
            Some(addr) => write!(f, "{} ", addr)?,
            None => write!(f, "????:???? ")?,
        }
        write!(
            f,
            "{} {}: {}",
            self.severity.as_str(),
            self.code.as_str(),
            self.message()
        )
    }
}

/// Diagnostics of one analysis session, in discovery order.
#[derive(Debug, Clone, Default)]
pub struct ErrorCollection {
    items: Vec<Diagnostic>,
}

impl ErrorCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Error => tracing::debug!(%diagnostic, "analysis error"),
            _ => tracing::trace!(%diagnostic, "analysis note"),
        }
        self.items.push(diagnostic);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn with_code(&self, code: ErrorCode) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter().filter(move |d| d.code == code)
    }

    pub fn with_severity(&self, severity: Severity) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter().filter(move |d| d.severity == severity)
    }

    /// Copy of the diagnostics ordered by severity, then location.
    pub fn sorted(&self) -> Vec<Diagnostic> {
        let mut out = self.items.clone();
        out.sort_by_key(|d| (d.severity, d.location));
        out
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Drop every diagnostic with `code`.
    pub fn remove_code(&mut self, code: ErrorCode) {
        self.items.retain(|d| d.code != code);
    }
}
