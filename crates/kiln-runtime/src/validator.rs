//! Static security validation of script source.
//!
//! Runs before anything is compiled. Checks, in order:
//!
//! 1. every referenced root namespace is an allowed builtin, a script-local
//!    name, or an API namespace the permissions grant;
//! 2. no qualified name matches the deny list;
//! 3. loop and recursion heuristics plus configured forbidden patterns;
//! 4. per-function cyclomatic complexity and nesting depth.
//!
//! The validator is stateless. All analysis is charged against a work
//! budget counted in units, not wall time, so the same input always yields
//! the same verdict.

use crate::analysis::ScriptAnalysis;
use crate::capability::{ApiCategory, SecurityPermissions};
use crate::diagnostic::{Diagnostic, Severity};
use crate::error::{RuntimeError, RuntimeResult};
use crate::lexer::{tokenize, TokenKind};
use crate::source::content_hash;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Builtins scripts may reference freely.
pub const ALLOWED_BUILTINS: &[&str] = &[
    "string",
    "table",
    "math",
    "utf8",
    "pairs",
    "ipairs",
    "type",
    "tostring",
    "tonumber",
    "select",
    "error",
    "assert",
    "pcall",
    "xpcall",
    "next",
    "setmetatable",
    "getmetatable",
    "rawequal",
    "rawlen",
    "print",
];

/// Names that are refused outright, matched on the whole qualified name or
/// as a namespace prefix.
pub const DENIED_APIS: &[&str] = &[
    "os",
    "io",
    "debug",
    "package",
    "require",
    "load",
    "loadstring",
    "loadfile",
    "dofile",
    "string.dump",
    "collectgarbage",
    "coroutine",
    "_G",
    "_ENV",
    "setfenv",
    "getfenv",
    "rawset",
    "rawget",
];

const DECISION_KEYWORDS: &[&str] = &["if", "elseif", "while", "for", "repeat", "and", "or"];

/// Upper bound on matches reported per forbidden pattern.
const MAX_PATTERN_REPORTS: usize = 8;

/// Limits and extra rules applied by the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationPolicy {
    /// Largest accepted source, in bytes.
    pub max_source_bytes: usize,

    /// Highest cyclomatic complexity per function.
    pub max_complexity: u32,

    /// Deepest block or bracket nesting.
    pub max_nesting: u32,

    /// Work units available to the analysis.
    pub work_budget: u64,

    /// Additional regular expressions that reject a script when matched.
    pub extra_patterns: Vec<String>,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            max_source_bytes: 512 * 1024,
            max_complexity: 60,
            max_nesting: 40,
            work_budget: 4_000_000,
            extra_patterns: Vec::new(),
        }
    }
}

/// Overall outcome of validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Warnings,
    Rejected,
}

/// Verdict plus located diagnostics for one script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub script_id: String,
    pub content_hash: String,
    pub verdict: Verdict,
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationReport {
    fn new(script_id: &str, content_hash: String, mut diagnostics: Vec<Diagnostic>) -> Self {
        diagnostics.sort_by(|a, b| {
            (a.line, a.column, &a.code, &a.message).cmp(&(b.line, b.column, &b.code, &b.message))
        });
        diagnostics.dedup();
        let verdict = if diagnostics.iter().any(Diagnostic::is_error) {
            Verdict::Rejected
        } else if diagnostics.iter().any(|d| d.severity == Severity::Warning) {
            Verdict::Warnings
        } else {
            Verdict::Pass
        };
        Self {
            script_id: script_id.to_string(),
            content_hash,
            verdict,
            diagnostics,
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.verdict == Verdict::Rejected
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Warning)
    }

    /// Whether any diagnostic carries `code`.
    pub fn has_code(&self, code: &str) -> bool {
        self.diagnostics.iter().any(|d| d.code == code)
    }

    /// One-line description of the blocking errors.
    pub fn summary(&self) -> String {
        let errors: Vec<String> = self.errors().map(ToString::to_string).collect();
        if errors.is_empty() {
            format!("{:?}", self.verdict).to_lowercase()
        } else {
            errors.join("; ")
        }
    }

    /// Turn a rejection into [`RuntimeError::ValidationRejected`].
    pub fn into_result(self) -> RuntimeResult<Self> {
        if self.is_rejected() {
            return Err(RuntimeError::ValidationRejected {
                script_id: self.script_id.clone(),
                summary: self.summary(),
            });
        }
        Ok(self)
    }
}

/// Deterministic work counter.
struct Budget {
    remaining: u64,
    exhausted: bool,
}

impl Budget {
    fn new(units: u64) -> Self {
        Self {
            remaining: units,
            exhausted: false,
        }
    }

    /// Charge `units`; false once the budget is gone.
    fn spend(&mut self, units: usize) -> bool {
        let units = units as u64;
        if self.exhausted || units > self.remaining {
            self.exhausted = true;
            return false;
        }
        self.remaining -= units;
        true
    }
}

/// Category guarding a root name, if any.
pub fn category_for_root(root: &str) -> Option<ApiCategory> {
    if root == "print" {
        return Some(ApiCategory::Logging);
    }
    ApiCategory::from_namespace(root)
}

/// The deny-list entry matching a qualified name.
pub fn denied_match(name: &str) -> Option<&'static str> {
    DENIED_APIS.iter().copied().find(|denied| {
        name == *denied
            || (name.len() > denied.len()
                && name.starts_with(denied)
                && name.as_bytes()[denied.len()] == b'.')
    })
}

/// Static security validator.
#[derive(Debug, Clone)]
pub struct SecurityValidator {
    policy: ValidationPolicy,
    patterns: Vec<(String, Regex)>,
}

impl SecurityValidator {
    /// Build a validator, compiling the policy's extra patterns.
    pub fn new(policy: ValidationPolicy) -> RuntimeResult<Self> {
        let patterns = policy
            .extra_patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .size_limit(1 << 20)
                    .dfa_size_limit(1 << 20)
                    .build()
                    .map(|re| (p.clone(), re))
                    .map_err(|e| {
                        RuntimeError::Unsupported(format!("invalid forbidden pattern '{}': {}", p, e))
                    })
            })
            .collect::<RuntimeResult<Vec<_>>>()?;
        Ok(Self { policy, patterns })
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Validate one script against a permission set.
    pub fn validate(
        &self,
        script_id: &str,
        source: &str,
        permissions: &SecurityPermissions,
    ) -> ValidationReport {
        let hash = content_hash(source);

        if source.len() > self.policy.max_source_bytes {
            let diag = Diagnostic::error(
                "source-too-large",
                format!(
                    "source is {} bytes, limit is {}",
                    source.len(),
                    self.policy.max_source_bytes
                ),
                0,
                0,
            );
            return ValidationReport::new(script_id, hash, vec![diag]);
        }

        let tokens = match tokenize(source) {
            Ok(tokens) => tokens,
            Err(e) => {
                let diag = Diagnostic::error("lex-error", e.message, e.line, e.column);
                return ValidationReport::new(script_id, hash, vec![diag]);
            }
        };

        let mut budget = Budget::new(self.policy.work_budget);
        let mut diagnostics = Vec::new();

        if budget.spend(tokens.len()) {
            let analysis = ScriptAnalysis::new(tokens);
            diagnostics.extend(Self::check_surface(&analysis, permissions));
            self.check_heuristics(&analysis, source, &mut budget, &mut diagnostics);
            self.check_complexity(&analysis, &mut budget, &mut diagnostics);
        }

        if budget.exhausted {
            diagnostics.push(Diagnostic::error(
                "analysis-budget-exceeded",
                format!("analysis needed more than {} work units", self.policy.work_budget),
                0,
                0,
            ));
        }

        let report = ValidationReport::new(script_id, hash, diagnostics);
        debug!(
            script = script_id,
            verdict = ?report.verdict,
            diagnostics = report.diagnostics.len(),
            "Validated script"
        );
        report
    }

    /// Namespace allow-list and deny-list checks over every reference.
    ///
    /// Also used by the compiler as a second enforcement point.
    pub fn check_surface(
        analysis: &ScriptAnalysis,
        permissions: &SecurityPermissions,
    ) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();

        for r in &analysis.references {
            if let Some(denied) = denied_match(&r.name) {
                diagnostics.push(Diagnostic::error(
                    "forbidden-api",
                    format!("use of '{}' is forbidden", denied),
                    r.line,
                    r.column,
                ));
                continue;
            }
            if analysis.is_declared(&r.root) {
                continue;
            }
            match category_for_root(&r.root) {
                Some(category) if !permissions.permits(category) => {
                    diagnostics.push(Diagnostic::error(
                        "category-denied",
                        format!(
                            "'{}' requires the '{}' capability, which this mod is not granted",
                            r.root, category
                        ),
                        r.line,
                        r.column,
                    ));
                }
                Some(_) => {}
                None if ALLOWED_BUILTINS.contains(&r.root.as_str()) => {}
                None => {
                    diagnostics.push(Diagnostic::error(
                        "namespace-not-allowed",
                        format!("'{}' is not an allowed namespace", r.root),
                        r.line,
                        r.column,
                    ));
                }
            }
        }

        diagnostics
    }

    fn check_heuristics(
        &self,
        analysis: &ScriptAnalysis,
        source: &str,
        budget: &mut Budget,
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        let tokens = &analysis.tokens;

        // Loops with a constant condition and no way out.
        for (i, token) in tokens.iter().enumerate() {
            if !budget.spend(1) {
                return;
            }
            let body = if token.is_keyword("while")
                && tokens.get(i + 1).is_some_and(|t| t.is_keyword("true"))
                && tokens.get(i + 2).is_some_and(|t| t.is_keyword("do"))
            {
                analysis.block_end.get(&i).map(|&end| (i + 3)..end)
            } else if token.is_keyword("repeat") {
                analysis.block_end.get(&i).and_then(|&until| {
                    let constant = tokens
                        .get(until + 1)
                        .is_some_and(|t| t.is_keyword("false") || t.is_keyword("nil"));
                    let continues = tokens.get(until + 2).is_some_and(|t| {
                        t.is_keyword("and")
                            || t.is_keyword("or")
                            || t.is_symbol("==")
                            || t.is_symbol("~=")
                    });
                    (constant && !continues).then_some((i + 1)..until)
                })
            } else {
                None
            };

            let Some(body) = body else { continue };
            if !budget.spend(body.len()) {
                return;
            }
            let owner = analysis.owner_of(i);
            let exits = body.clone().any(|k| {
                let t = &tokens[k];
                (t.is_keyword("break") || t.is_keyword("return") || t.is_keyword("goto"))
                    && analysis.owner_of(k) == owner
            });
            if !exits {
                diagnostics.push(Diagnostic::warning(
                    "unbounded-loop",
                    "loop has a constant condition and no break, return or goto",
                    token.line,
                    token.column,
                ));
            }
        }

        // Functions that immediately call themselves.
        for f in &analysis.functions {
            if !budget.spend(1) {
                return;
            }
            let Some(name) = &f.name else { continue };
            if !tokens.get(f.body.start).is_some_and(|t| t.is_keyword("return")) {
                continue;
            }
            let recurses = analysis
                .references
                .iter()
                .find(|r| r.token == f.body.start + 1)
                .is_some_and(|r| r.called && &r.name == name);
            if recurses {
                diagnostics.push(Diagnostic::warning(
                    "infinite-recursion",
                    format!("function '{}' unconditionally calls itself", name),
                    f.line,
                    f.column,
                ));
            }
        }

        // Recursion through the script's own call graph.
        let mut by_name: BTreeMap<&str, usize> = BTreeMap::new();
        for (idx, f) in analysis.functions.iter().enumerate() {
            if let Some(name) = &f.name {
                by_name.entry(name.as_str()).or_insert(idx);
            }
        }
        let mut calls: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        for r in &analysis.references {
            if !budget.spend(1) {
                return;
            }
            if let (true, Some(caller), Some(&callee)) =
                (r.called, r.owner, by_name.get(r.name.as_str()))
            {
                calls.entry(caller).or_default().insert(callee);
            }
        }
        for (idx, f) in analysis.functions.iter().enumerate() {
            let Some(name) = &f.name else { continue };
            let mut seen = BTreeSet::new();
            let mut stack: Vec<usize> = calls.get(&idx).into_iter().flatten().copied().collect();
            let mut recursive = false;
            while let Some(next) = stack.pop() {
                if !budget.spend(1) {
                    return;
                }
                if next == idx {
                    recursive = true;
                    break;
                }
                if seen.insert(next) {
                    stack.extend(calls.get(&next).into_iter().flatten().copied());
                }
            }
            if recursive {
                diagnostics.push(Diagnostic::info(
                    "recursive-call",
                    format!("function '{}' is recursive", name),
                    f.line,
                    f.column,
                ));
            }
        }

        // Operator-supplied patterns.
        for (pattern, re) in &self.patterns {
            if !budget.spend(source.len() / 16 + 1) {
                return;
            }
            for m in re.find_iter(source).take(MAX_PATTERN_REPORTS) {
                let (line, column) = position_of(source, m.start());
                diagnostics.push(Diagnostic::error(
                    "forbidden-pattern",
                    format!("source matches forbidden pattern '{}'", pattern),
                    line,
                    column,
                ));
            }
        }
    }

    fn check_complexity(
        &self,
        analysis: &ScriptAnalysis,
        budget: &mut Budget,
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        let mut decisions: BTreeMap<Option<usize>, u32> = BTreeMap::new();
        let mut block_reported = false;
        let mut bracket_reported = false;

        for (i, token) in analysis.tokens.iter().enumerate() {
            if !budget.spend(1) {
                return;
            }
            if token.kind == TokenKind::Keyword && DECISION_KEYWORDS.contains(&token.text.as_str()) {
                *decisions.entry(analysis.owner_of(i)).or_default() += 1;
            }
            if !block_reported && analysis.block_depth[i] > self.policy.max_nesting {
                block_reported = true;
                diagnostics.push(Diagnostic::error(
                    "nesting-exceeded",
                    format!("blocks nested deeper than {}", self.policy.max_nesting),
                    token.line,
                    token.column,
                ));
            }
            if !bracket_reported && analysis.bracket_depth[i] > self.policy.max_nesting {
                bracket_reported = true;
                diagnostics.push(Diagnostic::error(
                    "nesting-exceeded",
                    format!("brackets nested deeper than {}", self.policy.max_nesting),
                    token.line,
                    token.column,
                ));
            }
        }

        for (owner, count) in decisions {
            let complexity = count + 1;
            if complexity <= self.policy.max_complexity {
                continue;
            }
            let (name, line, column) = match owner.and_then(|o| analysis.functions.get(o)) {
                Some(f) => (
                    f.name.clone().unwrap_or_else(|| "<anonymous>".to_string()),
                    f.line,
                    f.column,
                ),
                None => ("<chunk>".to_string(), 1, 1),
            };
            diagnostics.push(Diagnostic::error(
                "complexity-exceeded",
                format!(
                    "'{}' has cyclomatic complexity {}, limit is {}",
                    name, complexity, self.policy.max_complexity
                ),
                line,
                column,
            ));
        }
    }
}

/// 1-based line and column of a byte offset.
fn position_of(source: &str, offset: usize) -> (u32, u32) {
    let before = &source[..offset];
    let line = before.matches('\n').count() as u32 + 1;
    let column = before
        .rsplit('\n')
        .next()
        .map_or(0, |l| l.chars().count()) as u32
        + 1;
    (line, column)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::TrustLevel;

    fn validator() -> SecurityValidator {
        SecurityValidator::new(ValidationPolicy::default()).unwrap()
    }

    fn untrusted() -> SecurityPermissions {
        SecurityPermissions::for_trust(TrustLevel::Untrusted)
    }

    fn trusted() -> SecurityPermissions {
        SecurityPermissions::for_trust(TrustLevel::Trusted)
    }

    #[test]
    fn test_clean_script_passes() {
        let source = r#"
local Healer = {}
function Healer:heal(entity, amount)
    local hp = entities.get(entity, "hp") or 0
    return hp + amount
end
function init()
    for _, e in ipairs(entities.query("hp")) do
        log.info("entity " .. tostring(e))
    end
    events.publish("healer_ready", { count = #entities.query("hp") })
end
"#;
        let report = validator().validate("healer.lua", source, &untrusted());
        assert_eq!(report.verdict, Verdict::Pass, "{:?}", report.diagnostics);
    }

    #[test]
    fn test_denied_api_rejected() {
        let report = validator().validate("evil.lua", "os.execute('rm -rf /')", &trusted());
        assert!(report.is_rejected());
        assert!(report.has_code("forbidden-api"));
        let d = report.errors().next().unwrap();
        assert_eq!((d.line, d.column), (1, 1));

        for source in [
            "local f = load('return 1')",
            "local d = string.dump(print)",
            "local x = _G['os']",
            "local s = string['dump']",
            r#"local s = string["\100ump"]"#,
            r#"local s = string['\x64\u{75}mp']"#,
            "local c = coroutine.wrap(function() end)",
            "rawset({}, 'a', 1)",
        ] {
            let report = validator().validate("evil.lua", source, &trusted());
            assert!(report.has_code("forbidden-api"), "{source}");
        }
    }

    #[test]
    fn test_unlisted_namespace_rejected() {
        let report = validator().validate("net.lua", "socket.connect('host', 80)", &trusted());
        assert!(report.is_rejected());
        assert!(report.has_code("namespace-not-allowed"));
    }

    #[test]
    fn test_category_denied_for_untrusted() {
        let source = "shared.set('score', 1)\nhooks.register('on_turn', 'f')";
        let report = validator().validate("s.lua", source, &untrusted());
        assert!(report.is_rejected());
        assert_eq!(report.errors().filter(|d| d.code == "category-denied").count(), 2);

        let report = validator().validate("s.lua", source, &trusted());
        assert_eq!(report.verdict, Verdict::Pass);
    }

    #[test]
    fn test_locals_shadow_namespaces() {
        let source = "local socket = {}\nfunction socket.connect() end\nsocket.connect()";
        let report = validator().validate("ok.lua", source, &untrusted());
        assert!(!report.is_rejected(), "{:?}", report.diagnostics);
    }

    #[test]
    fn test_unbounded_loop_warning() {
        let report = validator().validate("spin.lua", "while true do end", &trusted());
        assert_eq!(report.verdict, Verdict::Warnings);
        assert!(report.has_code("unbounded-loop"));

        let ok = validator().validate(
            "loop.lua",
            "while true do if math.random() > 0.5 then break end end",
            &trusted(),
        );
        assert!(!ok.has_code("unbounded-loop"));

        let inner_return = validator().validate(
            "loop.lua",
            "while true do local f = function() return 1 end end",
            &trusted(),
        );
        assert!(inner_return.has_code("unbounded-loop"));

        let repeat = validator().validate("r.lua", "repeat local x = 1 until false", &trusted());
        assert!(repeat.has_code("unbounded-loop"));
    }

    #[test]
    fn test_recursion_heuristics() {
        let source = "function f(n) return f(n) end";
        let report = validator().validate("rec.lua", source, &trusted());
        assert!(report.has_code("infinite-recursion"));
        assert!(report.has_code("recursive-call"));

        let mutual = "function a(n) if n > 0 then return b(n - 1) end end\nfunction b(n) return a(n) end";
        let report = validator().validate("mut.lua", mutual, &trusted());
        assert!(!report.has_code("infinite-recursion"));
        assert_eq!(
            report.diagnostics.iter().filter(|d| d.code == "recursive-call").count(),
            2
        );
        assert_eq!(report.verdict, Verdict::Pass);
    }

    #[test]
    fn test_complexity_ceiling() {
        let policy = ValidationPolicy {
            max_complexity: 3,
            ..Default::default()
        };
        let v = SecurityValidator::new(policy).unwrap();
        let source = "function f(a, b)\n if a and b then elseif a or b then end\n while a do end\nend";
        let report = v.validate("c.lua", source, &trusted());
        let d = report
            .errors()
            .find(|d| d.code == "complexity-exceeded")
            .unwrap();
        assert!(d.message.contains("'f'"));
        assert_eq!(d.line, 1);
    }

    #[test]
    fn test_nesting_ceiling() {
        let policy = ValidationPolicy {
            max_nesting: 4,
            ..Default::default()
        };
        let v = SecurityValidator::new(policy).unwrap();
        let deep = "local t = {{{{{{1}}}}}}";
        assert!(v.validate("n.lua", deep, &trusted()).has_code("nesting-exceeded"));
        let blocks = "do do do do do local x = 1 end end end end end";
        assert!(v.validate("n.lua", blocks, &trusted()).has_code("nesting-exceeded"));
    }

    #[test]
    fn test_extra_patterns() {
        let policy = ValidationPolicy {
            extra_patterns: vec![r"string\.rep\s*\(".to_string()],
            ..Default::default()
        };
        let v = SecurityValidator::new(policy).unwrap();
        let report = v.validate("p.lua", "local x = 1\nlocal s = string.rep('a', 1e9)", &trusted());
        let d = report.errors().find(|d| d.code == "forbidden-pattern").unwrap();
        assert_eq!((d.line, d.column), (2, 11));

        let bad = ValidationPolicy {
            extra_patterns: vec!["(".to_string()],
            ..Default::default()
        };
        assert!(SecurityValidator::new(bad).is_err());
    }

    #[test]
    fn test_budget_exhaustion_rejects() {
        let policy = ValidationPolicy {
            work_budget: 10,
            ..Default::default()
        };
        let v = SecurityValidator::new(policy).unwrap();
        let source = "local a = 1\n".repeat(50);
        let report = v.validate("big.lua", &source, &trusted());
        assert!(report.has_code("analysis-budget-exceeded"));
        assert!(report.is_rejected());
    }

    #[test]
    fn test_lexical_and_size_errors() {
        let report = validator().validate("s.lua", "local s = 'open", &trusted());
        assert!(report.has_code("lex-error"));

        let policy = ValidationPolicy {
            max_source_bytes: 8,
            ..Default::default()
        };
        let v = SecurityValidator::new(policy).unwrap();
        assert!(v.validate("s.lua", "return 12345678", &trusted()).has_code("source-too-large"));
    }

    #[test]
    fn test_deterministic() {
        let source = "while true do end\nos.exit()\nfunction f() return f() end";
        let a = validator().validate("d.lua", source, &trusted());
        let b = validator().validate("d.lua", source, &trusted());
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejection_converts_to_error() {
        let report = validator().validate("x.lua", "io.open('f')", &trusted());
        let err = report.into_result().unwrap_err();
        assert!(matches!(err, RuntimeError::ValidationRejected { .. }));
        assert!(err.to_string().contains("forbidden-api"));
    }
}
