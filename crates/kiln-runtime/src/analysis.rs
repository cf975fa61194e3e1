//! Structural analysis over a token stream.
//!
//! Recovers what static checks need without a full parser: block nesting,
//! function definitions, declared names and every qualified reference
//! (`a.b.c`, `a:b`, `a["b"]`) together with the function that contains it.

use crate::lexer::{Token, TokenKind};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;

/// Longest `a, b, c = ...` target list recognised.
const MAX_ASSIGN_TARGETS: usize = 64;

/// A qualified name used by the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Dotted name, with `:` normalised to `.`.
    pub name: String,
    pub root: String,
    pub line: u32,
    pub column: u32,
    /// Token index of the root name.
    pub token: usize,
    /// Whether the reference is immediately called.
    pub called: bool,
    /// Index into [`ScriptAnalysis::functions`] of the enclosing function.
    pub owner: Option<usize>,
}

/// A `function` definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    /// Dotted name for named definitions.
    pub name: Option<String>,
    pub local: bool,
    /// Defined at chunk level, outside every other function.
    pub top_level: bool,
    pub params: Vec<String>,
    /// Token index of the `function` keyword.
    pub start: usize,
    /// Tokens of the body, excluding the closing `end`.
    pub body: Range<usize>,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Function,
    If,
    Loop { awaiting_do: bool },
    Do,
    Repeat,
}

/// Result of analysing one script.
#[derive(Debug, Clone, Default)]
pub struct ScriptAnalysis {
    pub tokens: Vec<Token>,
    /// Names declared with `local`, as parameters or as loop variables.
    pub locals: BTreeSet<String>,
    /// Globals the script defines itself, with the first definition site.
    pub globals: BTreeMap<String, (u32, u32)>,
    pub references: Vec<Reference>,
    pub functions: Vec<FunctionInfo>,
    /// Opener token index to closer (`end`/`until`) token index.
    pub block_end: HashMap<usize, usize>,
    /// Block depth before each token.
    pub block_depth: Vec<u32>,
    /// Bracket depth before each token.
    pub bracket_depth: Vec<u32>,
    /// Whether the innermost open bracket before each token is `{`.
    in_table: Vec<bool>,
    /// Innermost function whose body holds each token.
    owners: Vec<Option<usize>>,
    /// First closer without an opener, or an opener never closed.
    pub unbalanced: Option<(u32, u32)>,
}

impl ScriptAnalysis {
    pub fn new(tokens: Vec<Token>) -> Self {
        let mut analysis = ScriptAnalysis {
            tokens,
            ..Default::default()
        };
        analysis.scan_blocks();
        analysis.scan_functions();
        analysis.scan_declarations();
        analysis.scan_references();
        analysis
    }

    fn tok(&self, i: usize) -> Option<&Token> {
        self.tokens.get(i)
    }

    fn is_symbol_at(&self, i: usize, symbol: &str) -> bool {
        self.tok(i).is_some_and(|t| t.is_symbol(symbol))
    }

    fn is_keyword_at(&self, i: usize, word: &str) -> bool {
        self.tok(i).is_some_and(|t| t.is_keyword(word))
    }

    fn is_name_at(&self, i: usize) -> bool {
        self.tok(i).is_some_and(Token::is_name)
    }

    fn prev(&self, i: usize) -> Option<&Token> {
        i.checked_sub(1).and_then(|p| self.tok(p))
    }

    fn scan_blocks(&mut self) {
        let mut stack: Vec<(BlockKind, usize)> = Vec::new();
        let mut brackets: Vec<&str> = Vec::new();
        let mut block_depth = Vec::with_capacity(self.tokens.len());
        let mut bracket_depth = Vec::with_capacity(self.tokens.len());
        let mut in_table = Vec::with_capacity(self.tokens.len());

        for (i, token) in self.tokens.iter().enumerate() {
            block_depth.push(stack.len() as u32);
            bracket_depth.push(brackets.len() as u32);
            in_table.push(brackets.last() == Some(&"{"));

            match (token.kind, token.text.as_str()) {
                (TokenKind::Keyword, "function") => stack.push((BlockKind::Function, i)),
                (TokenKind::Keyword, "if") => stack.push((BlockKind::If, i)),
                (TokenKind::Keyword, "while" | "for") => {
                    stack.push((BlockKind::Loop { awaiting_do: true }, i))
                }
                (TokenKind::Keyword, "repeat") => stack.push((BlockKind::Repeat, i)),
                (TokenKind::Keyword, "do") => match stack.last_mut() {
                    Some((BlockKind::Loop { awaiting_do }, _)) if *awaiting_do => {
                        *awaiting_do = false;
                    }
                    _ => stack.push((BlockKind::Do, i)),
                },
                (TokenKind::Keyword, "end") => match stack.pop() {
                    Some((kind, opener)) if kind != BlockKind::Repeat => {
                        self.block_end.insert(opener, i);
                    }
                    _ => {
                        self.unbalanced.get_or_insert((token.line, token.column));
                    }
                },
                (TokenKind::Keyword, "until") => match stack.pop() {
                    Some((BlockKind::Repeat, opener)) => {
                        self.block_end.insert(opener, i);
                    }
                    _ => {
                        self.unbalanced.get_or_insert((token.line, token.column));
                    }
                },
                (TokenKind::Symbol, "(" | "{" | "[") => brackets.push(token.text.as_str()),
                (TokenKind::Symbol, ")" | "}" | "]") => {
                    if brackets.pop().is_none() {
                        self.unbalanced.get_or_insert((token.line, token.column));
                    }
                }
                _ => {}
            }
        }

        if let Some((_, opener)) = stack.first() {
            let t = &self.tokens[*opener];
            self.unbalanced.get_or_insert((t.line, t.column));
        }
        self.block_depth = block_depth;
        self.bracket_depth = bracket_depth;
        self.in_table = in_table;
    }

    /// Read `Name {. Name} [: Name]` starting at `i`; returns the dotted name,
    /// the index after it and whether it names a method.
    fn function_name(&self, i: usize) -> Option<(String, usize, bool)> {
        if !self.is_name_at(i) {
            return None;
        }
        let mut parts = vec![self.tokens[i].text.clone()];
        let mut j = i + 1;
        let mut method = false;
        while (self.is_symbol_at(j, ".") || self.is_symbol_at(j, ":")) && self.is_name_at(j + 1) {
            method = self.is_symbol_at(j, ":");
            parts.push(self.tokens[j + 1].text.clone());
            j += 2;
        }
        Some((parts.join("."), j, method))
    }

    fn scan_functions(&mut self) {
        let mut functions = Vec::new();

        for i in 0..self.tokens.len() {
            if !self.is_keyword_at(i, "function") {
                continue;
            }
            let local = self.prev(i).is_some_and(|t| t.is_keyword("local"));
            let (name, mut j, method) = match self.function_name(i + 1) {
                Some((name, next, method)) => (Some(name), next, method),
                None => (None, i + 1, false),
            };
            if !self.is_symbol_at(j, "(") {
                continue;
            }
            j += 1;
            let mut params = Vec::new();
            if method {
                params.push("self".to_string());
            }
            while let Some(t) = self.tok(j) {
                if t.is_symbol(")") {
                    break;
                }
                if t.is_name() {
                    params.push(t.text.clone());
                }
                j += 1;
            }
            let end = self.block_end.get(&i).copied().unwrap_or(self.tokens.len());
            let token = &self.tokens[i];
            functions.push(FunctionInfo {
                name,
                local,
                top_level: false,
                params,
                start: i,
                body: (j + 1).min(end)..end,
                line: token.line,
                column: token.column,
            });
        }

        // Bodies nest, and both starts and body starts increase with index.
        let mut owners = vec![None; self.tokens.len()];
        let mut active: Vec<usize> = Vec::new();
        let mut next = 0;
        for (i, owner) in owners.iter_mut().enumerate() {
            while active.last().is_some_and(|&top| functions[top].body.end <= i) {
                active.pop();
            }
            while next < functions.len() && functions[next].body.start <= i {
                if functions[next].body.contains(&i) {
                    active.push(next);
                }
                next += 1;
            }
            *owner = active.last().copied();
        }
        for f in functions.iter_mut() {
            f.top_level = owners.get(f.start).copied().flatten().is_none();
        }

        self.functions = functions;
        self.owners = owners;
    }

    /// Index of the innermost function whose body contains token `i`.
    pub fn owner_of(&self, i: usize) -> Option<usize> {
        self.owners.get(i).copied().flatten()
    }

    fn scan_declarations(&mut self) {
        let mut locals = BTreeSet::new();

        for f in &self.functions {
            locals.extend(f.params.iter().cloned());
            if f.local {
                if let Some(name) = &f.name {
                    locals.insert(name.clone());
                }
            }
        }

        for i in 0..self.tokens.len() {
            if self.is_keyword_at(i, "local") || self.is_keyword_at(i, "for") {
                let mut j = i + 1;
                while self.is_name_at(j) {
                    locals.insert(self.tokens[j].text.clone());
                    j += 1;
                    if self.is_symbol_at(j, "<") && self.is_symbol_at(j + 2, ">") {
                        j += 3;
                    }
                    if !self.is_symbol_at(j, ",") {
                        break;
                    }
                    j += 1;
                }
            }
        }

        let mut globals = BTreeMap::new();
        for f in &self.functions {
            if f.local {
                continue;
            }
            if let Some(name) = &f.name {
                let root = name.split('.').next().unwrap_or(name);
                if !locals.contains(root) {
                    globals.entry(root.to_string()).or_insert((f.line, f.column));
                }
            }
        }

        for i in 0..self.tokens.len() {
            if !self.is_assignment_target(i) {
                continue;
            }
            let t = &self.tokens[i];
            if !locals.contains(&t.text) {
                globals.entry(t.text.clone()).or_insert((t.line, t.column));
            }
        }

        self.locals = locals;
        self.globals = globals;
    }

    fn in_table_constructor(&self, i: usize) -> bool {
        self.in_table.get(i).copied().unwrap_or(false)
    }

    /// A bare name assigned with `=`, directly or as part of `a, b = ...`.
    pub fn is_assignment_target(&self, i: usize) -> bool {
        if !self.is_name_at(i) {
            return false;
        }
        if let Some(prev) = self.prev(i) {
            if prev.is_symbol(".") || prev.is_symbol(":") || prev.is_keyword("local") {
                return false;
            }
        }
        let mut j = i + 1;
        for _ in 0..MAX_ASSIGN_TARGETS {
            if self.is_symbol_at(j, "=") {
                return !self.in_table_constructor(i);
            }
            if self.is_symbol_at(j, ",") && self.is_name_at(j + 1) {
                j += 2;
                continue;
            }
            return false;
        }
        false
    }

    fn scan_references(&mut self) {
        let mut references = Vec::new();

        for i in 0..self.tokens.len() {
            if !self.is_name_at(i) {
                continue;
            }
            if let Some(prev) = self.prev(i) {
                if prev.is_symbol(".")
                    || prev.is_symbol(":")
                    || prev.is_symbol("::")
                    || prev.is_keyword("goto")
                {
                    continue;
                }
                if prev.is_symbol("<") && self.is_symbol_at(i + 1, ">") {
                    // Variable attribute such as <const>.
                    continue;
                }
            }
            if self.is_symbol_at(i + 1, "=") && self.in_table_constructor(i) {
                continue;
            }

            let root = self.tokens[i].text.clone();
            let mut parts = vec![root.clone()];
            let mut j = i;
            loop {
                if (self.is_symbol_at(j + 1, ".") || self.is_symbol_at(j + 1, ":"))
                    && self.is_name_at(j + 2)
                {
                    parts.push(self.tokens[j + 2].text.clone());
                    j += 2;
                } else if let (true, Some(key), true) = (
                    self.is_symbol_at(j + 1, "["),
                    self.tok(j + 2).and_then(Token::string_value),
                    self.is_symbol_at(j + 3, "]"),
                ) {
                    parts.push(key);
                    j += 3;
                } else {
                    break;
                }
            }
            let called = self.is_symbol_at(j + 1, "(")
                || self.is_symbol_at(j + 1, "{")
                || self.tok(j + 1).is_some_and(|t| t.kind == TokenKind::Str);

            let token = &self.tokens[i];
            references.push(Reference {
                name: parts.join("."),
                root,
                line: token.line,
                column: token.column,
                token: i,
                called,
                owner: self.owner_of(i),
            });
        }

        self.references = references;
    }

    /// Whether a root name is declared by the script itself.
    pub fn is_declared(&self, name: &str) -> bool {
        self.locals.contains(name) || self.globals.contains_key(name)
    }

    /// Named functions defined at chunk level and reachable as globals.
    pub fn entry_points(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self
            .functions
            .iter()
            .filter(|f| f.top_level && !f.local)
            .filter_map(|f| f.name.clone())
            .filter(|n| !n.contains('.'))
            .collect();

        // name = function ... at chunk level
        for i in 0..self.tokens.len() {
            if self.block_depth.get(i) == Some(&0)
                && self.is_assignment_target(i)
                && self.is_symbol_at(i + 1, "=")
                && self.is_keyword_at(i + 2, "function")
                && !self.locals.contains(&self.tokens[i].text)
            {
                names.insert(self.tokens[i].text.clone());
            }
        }
        names.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn analyse(source: &str) -> ScriptAnalysis {
        ScriptAnalysis::new(tokenize(source).unwrap())
    }

    #[test]
    fn test_references_and_declarations() {
        let a = analyse(
            r#"
local count = 0
local function bump(n) count = count + n end
function init()
    bump(1)
    log.info("ready " .. string.format("%d", count))
    local t = { entities = 1, x = entities.query("hp") }
    return os["execute"]
end
"#,
        );
        assert!(a.locals.contains("count"));
        assert!(a.locals.contains("bump"));
        assert!(a.locals.contains("n"));
        assert!(a.globals.contains_key("init"));

        let names: Vec<&str> = a.references.iter().map(|r| r.name.as_str()).collect();
        assert!(names.contains(&"log.info"));
        assert!(names.contains(&"string.format"));
        assert!(names.contains(&"entities.query"));
        assert!(names.contains(&"os.execute"));
        // Table key, not a reference.
        assert_eq!(names.iter().filter(|n| **n == "entities").count(), 0);
        assert!(a.unbalanced.is_none());
        assert_eq!(a.entry_points(), vec!["init"]);
    }

    #[test]
    fn test_block_structure() {
        let a = analyse("while true do if x then end end repeat y() until false");
        assert!(a.unbalanced.is_none());
        assert_eq!(a.block_end.get(&0), Some(&7));
        assert_eq!(a.block_depth[4], 2);

        let bad = analyse("function f() if x then end");
        assert!(bad.unbalanced.is_some());
    }

    #[test]
    fn test_function_owners() {
        let a = analyse("function outer() local function inner() helper() end end");
        assert_eq!(a.functions.len(), 2);
        assert!(a.functions[0].top_level);
        assert!(!a.functions[1].top_level);
        let helper = a.references.iter().find(|r| r.name == "helper").unwrap();
        assert_eq!(helper.owner, Some(1));
        assert!(helper.called);
    }

    #[test]
    fn test_assigned_function_entry_points() {
        let a = analyse("on_tick = function(dt) end\nlocal hidden = function() end\nfunction M.x() end");
        assert_eq!(a.entry_points(), vec!["on_tick"]);
        assert!(a.globals.contains_key("on_tick"));
        assert!(a.globals.contains_key("M"));
    }
}
