//! The brace/line-tracking scanner: recovers exactly the structure the
//! rewrite in `rewrite.rs` needs from a token stream — function boundaries,
//! call-expression sites, and `return` statements — without building a full
//! ECMAScript AST (`SPEC_FULL.md` §4.1 records this as an explicit scope
//! decision).
//!
//! Known simplifications (documented further in `DESIGN.md`): destructured
//! parameters contribute `undefined` to the captured `args` array rather
//! than their bound names; a call is recognized as "awaited" only when it is
//! the direct operand of `await`/`yield` or the direct operand of a
//! `return` inside an `async` function — the remaining awaited-position
//! cases spec §4.1 lists (`for await...of`, nested inside a logical/
//! conditional expression) are not distinguished and default to
//! `unawaited = true`; code nested inside a template-literal interpolation
//! is not scanned, since the lexer treats template literals as opaque atoms.

use crate::lexer::{tokenize, Token, TokenKind};
use apptrace_core::FunctionKind;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Param {
    /// `None` for a destructuring pattern parameter.
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FunctionSite {
    pub kind: FunctionKind,
    /// The name found at the declaration/method-key position, before the
    /// display-name fallback chain in `rewrite.rs` is applied.
    pub declared_name: Option<String>,
    pub is_arrow: bool,
    pub is_async: bool,
    /// Index into the name-resolution scan: byte offset of the first token
    /// of this function (including `async`/modifiers), used to look
    /// backward for a variable-declarator or assignment name.
    pub decl_start: usize,
    pub body_open: usize,
    pub body_close: usize,
    pub is_expression_body: bool,
    pub params: Vec<Param>,
    pub line: u32,
    pub is_getter_setter: bool,
}

impl FunctionSite {
    fn contains(&self, pos: usize) -> bool {
        pos >= self.body_open && pos < self.body_close
    }
}

#[derive(Debug, Clone)]
pub struct CallSite {
    pub callee_start: usize,
    pub object_text: Option<String>,
    pub label: String,
    pub callee_text: String,
    pub paren_open: usize,
    pub paren_close: usize,
    pub line: u32,
    pub awaited: bool,
}

#[derive(Debug, Clone)]
pub struct ReturnStmt {
    pub kw_start: usize,
    pub kw_end: usize,
    /// `None` for a bare `return;` (or ASI-terminated `return`).
    pub expr: Option<(usize, usize)>,
    pub stmt_end: usize,
}

pub struct ParsedModule<'a> {
    pub source: &'a str,
    pub tokens: Vec<Token<'a>>,
    pub functions: Vec<FunctionSite>,
    pub calls: Vec<CallSite>,
    pub returns: Vec<(usize, ReturnStmt)>, // (enclosing function index, stmt)
}

struct Matches {
    paren: HashMap<usize, usize>,
    paren_rev: HashMap<usize, usize>,
    bracket_rev: HashMap<usize, usize>,
    brace: HashMap<usize, usize>,
}

fn build_matches(tokens: &[Token]) -> Matches {
    let mut paren = HashMap::new();
    let mut paren_rev = HashMap::new();
    let mut bracket_rev = HashMap::new();
    let mut brace = HashMap::new();
    let mut pstack = Vec::new();
    let mut bstack = Vec::new();
    let mut cstack = Vec::new();
    for (i, t) in tokens.iter().enumerate() {
        match t.text {
            "(" => pstack.push(i),
            ")" => {
                if let Some(open) = pstack.pop() {
                    paren.insert(open, i);
                    paren_rev.insert(i, open);
                }
            }
            "[" => bstack.push(i),
            "]" => {
                if let Some(open) = bstack.pop() {
                    bracket_rev.insert(i, open);
                }
            }
            "{" => cstack.push(i),
            "}" => {
                if let Some(open) = cstack.pop() {
                    brace.insert(open, i);
                }
            }
            _ => {}
        }
    }
    Matches {
        paren,
        paren_rev,
        bracket_rev,
        brace,
    }
}

/// Walks backward from the last token of an expression (`last_idx`,
/// inclusive) to the first token of the same expression, consuming a
/// postfix chain of member access (`.ident`, computed `[expr]`) and
/// call/group results (`(...)`). Used both to find a callee's start and,
/// generically, anywhere a "what expression ends here" question arises.
fn expr_start_before(tokens: &[Token], m: &Matches, last_idx: usize) -> usize {
    let mut cur = last_idx;
    loop {
        match tokens[cur].text {
            ")" => {
                if let Some(&open) = m.paren_rev.get(&cur) {
                    cur = open;
                } else {
                    return cur;
                }
            }
            "]" => {
                if let Some(&open) = m.bracket_rev.get(&cur) {
                    cur = open;
                } else {
                    return cur;
                }
            }
            _ => {}
        }
        if cur == 0 {
            return cur;
        }
        let before = cur - 1;
        if tokens[before].text == "." || tokens[before].text == "?." {
            if before == 0 {
                return before;
            }
            cur = before - 1;
            continue;
        }
        return cur;
    }
}

/// Scans forward from `start` for the extent of a bare expression: stops at
/// the first token, at local bracket depth 0, that is `;`/`,` or that would
/// close an enclosing group. Returns `(last_token_idx_inclusive,
/// consumed_semicolon)`.
fn scan_expr_extent(tokens: &[Token], start: usize) -> (usize, bool) {
    let mut depth = 0i32;
    let mut i = start;
    while i < tokens.len() {
        match tokens[i].text {
            "(" | "[" | "{" => depth += 1,
            ")" | "]" | "}" => {
                if depth > 0 {
                    depth -= 1;
                } else {
                    return (i.saturating_sub(1).max(start.saturating_sub(1)), false);
                }
            }
            ";" if depth == 0 => return (i, true),
            "," if depth == 0 => return (i.saturating_sub(1).max(start.saturating_sub(1)), false),
            _ => {}
        }
        if tokens[i].kind == TokenKind::Eof {
            return (i.saturating_sub(1), false);
        }
        i += 1;
    }
    (tokens.len().saturating_sub(1), false)
}

const CONTROL_KEYWORDS: &[&str] = &["if", "for", "while", "switch", "catch"];

fn split_params(src: &str) -> Vec<Param> {
    let toks = match tokenize(src) {
        Ok(t) => t,
        Err(_) => return Vec::new(),
    };
    let mut params = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    let mut i = 0usize;
    let push_slice = |toks: &[Token], a: usize, b: usize, out: &mut Vec<Param>| {
        if a >= b {
            return;
        }
        let slice = &toks[a..b];
        if slice.is_empty() {
            return;
        }
        let mut idx = 0;
        if slice[idx].text == "..." {
            idx += 1;
        }
        if idx < slice.len() && slice[idx].text == "{" || idx < slice.len() && slice[idx].text == "[" {
            out.push(Param { name: None });
            return;
        }
        if idx < slice.len() && slice[idx].kind == TokenKind::Ident {
            out.push(Param {
                name: Some(slice[idx].text.to_string()),
            });
        } else {
            out.push(Param { name: None });
        }
    };
    while i < toks.len() && toks[i].kind != TokenKind::Eof {
        match toks[i].text {
            "(" | "[" | "{" => depth += 1,
            ")" | "]" | "}" => depth -= 1,
            "," if depth == 0 => {
                push_slice(&toks, start, i, &mut params);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    push_slice(&toks, start, i, &mut params);
    params
}

fn resolve_declared_name(tokens: &[Token], decl_start: usize) -> Option<String> {
    if decl_start == 0 {
        return None;
    }
    let before = decl_start - 1;
    // `name = ` immediately before (reassignment or object-member
    // assignment — we only need the last identifier segment).
    if tokens[before].text == "=" && before > 0 {
        let name_idx = before - 1;
        if tokens[name_idx].kind == TokenKind::Ident {
            return Some(tokens[name_idx].text.to_string());
        }
    }
    // `key:` property-value position in an object literal.
    if tokens[before].text == ":" && before > 0 {
        let key_idx = before - 1;
        if tokens[key_idx].kind == TokenKind::Ident || tokens[key_idx].kind == TokenKind::String {
            return Some(tokens[key_idx].text.trim_matches(|c| c == '"' || c == '\'').to_string());
        }
    }
    None
}

/// Parses `src` into the structure the rewrite needs.
pub fn parse(src: &str) -> Result<ParsedModule<'_>, crate::error::TransformError> {
    let tokens = tokenize(src)?;
    let m = build_matches(&tokens);

    let mut functions = Vec::new();
    let mut param_paren_opens = std::collections::HashSet::new();

    let mut i = 0usize;
    while i < tokens.len() {
        let t = &tokens[i];
        if t.kind == TokenKind::Eof {
            break;
        }

        // `function` declarations/expressions: [async] function [*] [name] ( params ) { body }
        if t.text == "function" {
            let decl_start = if i > 0 && tokens[i - 1].text == "async" {
                i - 1
            } else {
                i
            };
            let mut j = i + 1;
            if j < tokens.len() && tokens[j].text == "*" {
                j += 1;
            }
            let mut declared_name = None;
            if j < tokens.len() && tokens[j].kind == TokenKind::Ident {
                declared_name = Some(tokens[j].text.to_string());
                j += 1;
            }
            if j < tokens.len() && tokens[j].text == "(" {
                param_paren_opens.insert(j);
                if let Some(&close) = m.paren.get(&j) {
                    let params_text = &src[tokens[j].end..tokens[close].start];
                    if close + 1 < tokens.len() && tokens[close + 1].text == "{" {
                        let body_open_idx = close + 1;
                        if let Some(&body_close_idx) = m.brace.get(&body_open_idx) {
                            functions.push(FunctionSite {
                                kind: FunctionKind::Function,
                                declared_name: declared_name
                                    .clone()
                                    .or_else(|| resolve_declared_name(&tokens, decl_start)),
                                is_arrow: false,
                                is_async: decl_start != i,
                                decl_start: tokens[decl_start].start,
                                body_open: tokens[body_open_idx].end,
                                body_close: tokens[body_close_idx].start,
                                is_expression_body: false,
                                params: split_params(params_text),
                                line: tokens[decl_start].line,
                                is_getter_setter: false,
                            });
                            i = body_close_idx + 1;
                            continue;
                        }
                    }
                }
            }
        }

        // Method shorthand: [static] [async] [*] [get|set] name ( params ) { body }
        // Only recognized at a member/statement boundary so control-flow
        // blocks (`if (...) {}`) are never mistaken for methods.
        if t.kind == TokenKind::Ident || (t.kind == TokenKind::Keyword && !CONTROL_KEYWORDS.contains(&t.text) && t.text != "function") {
            let boundary_ok = i == 0
                || matches!(tokens[i - 1].text, "{" | "," | ";" | "}")
                || tokens[i - 1].text == "*";
            if boundary_ok {
                let decl_start = i;
                let mut j = i;
                let mut is_static = false;
                let mut is_async = false;
                let mut is_getter = false;
                let mut is_setter = false;
                loop {
                    match tokens[j].text {
                        "static" => {
                            is_static = true;
                            j += 1;
                        }
                        "async" => {
                            is_async = true;
                            j += 1;
                        }
                        "*" => {
                            j += 1;
                        }
                        "get" if tokens.get(j + 1).map(|t| t.text) != Some("(") => {
                            is_getter = true;
                            j += 1;
                        }
                        "set" if tokens.get(j + 1).map(|t| t.text) != Some("(") => {
                            is_setter = true;
                            j += 1;
                        }
                        _ => break,
                    }
                }
                if j < tokens.len()
                    && (tokens[j].kind == TokenKind::Ident)
                    && tokens.get(j + 1).map(|t| t.text) == Some("(")
                {
                    let name_idx = j;
                    let paren_idx = j + 1;
                    param_paren_opens.insert(paren_idx);
                    if let Some(&close) = m.paren.get(&paren_idx) {
                        if close + 1 < tokens.len() && tokens[close + 1].text == "{" {
                            let body_open_idx = close + 1;
                            if let Some(&body_close_idx) = m.brace.get(&body_open_idx) {
                                let params_text = &src[tokens[paren_idx].end..tokens[close].start];
                                let kind = if is_getter {
                                    FunctionKind::Getter
                                } else if is_setter {
                                    FunctionKind::Setter
                                } else if is_static {
                                    FunctionKind::StaticMethod
                                } else {
                                    FunctionKind::Method
                                };
                                functions.push(FunctionSite {
                                    kind,
                                    declared_name: Some(tokens[name_idx].text.trim_start_matches('#').to_string()),
                                    is_arrow: false,
                                    is_async,
                                    decl_start: tokens[decl_start].start,
                                    body_open: tokens[body_open_idx].end,
                                    body_close: tokens[body_close_idx].start,
                                    is_expression_body: false,
                                    params: split_params(params_text),
                                    line: tokens[decl_start].line,
                                    is_getter_setter: is_getter || is_setter,
                                });
                                i = body_close_idx + 1;
                                continue;
                            }
                        }
                    }
                }
            }
        }

        i += 1;
    }

    // Arrow functions: located by scanning for `=>`, independent of the
    // method/function-declaration pass above (arrows never match those
    // patterns since they have no `function` keyword and aren't member
    // declarations).
    for idx in 0..tokens.len() {
        if tokens[idx].text != "=>" {
            continue;
        }
        let mut params = Vec::new();
        let mut decl_start_idx = idx;
        let mut is_async = false;
        if idx > 0 && tokens[idx - 1].text == ")" {
            if let Some(&open) = m.paren_rev.get(&(idx - 1)) {
                param_paren_opens.insert(open);
                let params_text = &src[tokens[open].end..tokens[idx - 1].start];
                params = split_params(params_text);
                decl_start_idx = open;
                if open > 0 && tokens[open - 1].text == "async" {
                    is_async = true;
                    decl_start_idx = open - 1;
                }
            }
        } else if idx > 0 && tokens[idx - 1].kind == TokenKind::Ident {
            params.push(Param {
                name: Some(tokens[idx - 1].text.to_string()),
            });
            decl_start_idx = idx - 1;
            if idx > 1 && tokens[idx - 2].text == "async" {
                is_async = true;
                decl_start_idx = idx - 2;
            }
        } else {
            continue;
        }

        let body_start_idx = idx + 1;
        if body_start_idx >= tokens.len() {
            continue;
        }
        if tokens[body_start_idx].text == "{" {
            if let Some(&close) = m.brace.get(&body_start_idx) {
                functions.push(FunctionSite {
                    kind: FunctionKind::Arrow,
                    declared_name: resolve_declared_name(&tokens, decl_start_idx),
                    is_arrow: true,
                    is_async,
                    decl_start: tokens[decl_start_idx].start,
                    body_open: tokens[body_start_idx].end,
                    body_close: tokens[close].start,
                    is_expression_body: false,
                    params,
                    line: tokens[decl_start_idx].line,
                    is_getter_setter: false,
                });
            }
        } else {
            let (last_idx, _) = scan_expr_extent(&tokens, body_start_idx);
            functions.push(FunctionSite {
                kind: FunctionKind::Arrow,
                declared_name: resolve_declared_name(&tokens, decl_start_idx),
                is_arrow: true,
                is_async,
                decl_start: tokens[decl_start_idx].start,
                body_open: tokens[body_start_idx].start,
                body_close: tokens[last_idx].end,
                is_expression_body: true,
                params,
                line: tokens[decl_start_idx].line,
                is_getter_setter: false,
            });
        }
    }

    functions.sort_by_key(|f| f.body_open);

    // Call sites.
    let mut calls = Vec::new();
    for (j, t) in tokens.iter().enumerate() {
        if t.text != "(" || param_paren_opens.contains(&j) {
            continue;
        }
        if j == 0 {
            continue;
        }
        let prev = &tokens[j - 1];
        if prev.text == "?." {
            continue; // optional call: foo?.(args)
        }
        if prev.text == "import" {
            continue; // dynamic import
        }
        if CONTROL_KEYWORDS.contains(&prev.text) {
            continue;
        }
        let is_member = j >= 2 && matches!(tokens[j - 2].text, "." | "?.") && prev.kind == TokenKind::Ident;
        let (callee_start, object_text, label) = if is_member {
            let dot_idx = j - 2;
            let obj_last = dot_idx - 1;
            let obj_start = expr_start_before(&tokens, &m, obj_last);
            (
                obj_start,
                Some(src[tokens[obj_start].start..tokens[obj_last].end].to_string()),
                prev.text.to_string(),
            )
        } else {
            if prev.text == "super" && (j < 2 || tokens[j - 2].text != ".") {
                continue; // bare super(...) constructor call
            }
            let start = expr_start_before(&tokens, &m, j - 1);
            (start, None, src[tokens[start].start..prev.end].to_string())
        };

        if callee_start > 0 && tokens[callee_start - 1].text == "new" {
            continue; // constructor call, not instrumented
        }

        let close = match m.paren.get(&j) {
            Some(&c) => c,
            None => continue,
        };

        let awaited = is_directly_awaited(&tokens, callee_start)
            || is_returned_from_async(&tokens, callee_start, &functions, &m);

        calls.push(CallSite {
            callee_start,
            object_text,
            label,
            callee_text: src[tokens[callee_start].start..prev.end].to_string(),
            paren_open: j,
            paren_close: close,
            line: tokens[callee_start].line,
            awaited,
        });
    }

    // Return statements, attributed to their innermost enclosing function.
    let mut returns = Vec::new();
    for (idx, t) in tokens.iter().enumerate() {
        if t.text != "return" {
            continue;
        }
        let pos = t.start;
        let owner = functions
            .iter()
            .enumerate()
            .filter(|(_, f)| f.contains(pos) && !f.is_expression_body)
            .min_by_key(|(_, f)| f.body_close - f.body_open);
        let owner_idx = match owner {
            Some((oi, _)) => oi,
            None => continue,
        };

        let next = idx + 1;
        let bare = next >= tokens.len()
            || tokens[next].text == ";"
            || tokens[next].text == "}"
            || tokens[next].preceded_by_newline;

        if bare {
            let stmt_end = if next < tokens.len() && tokens[next].text == ";" {
                tokens[next].end
            } else {
                t.end
            };
            returns.push((
                owner_idx,
                ReturnStmt {
                    kw_start: t.start,
                    kw_end: t.end,
                    expr: None,
                    stmt_end,
                },
            ));
            continue;
        }

        let (last_idx, consumed_semi) = scan_expr_extent(&tokens, next);
        let expr_end = tokens[last_idx].end;
        let stmt_end = if consumed_semi { tokens[last_idx].end } else { expr_end };
        returns.push((
            owner_idx,
            ReturnStmt {
                kw_start: t.start,
                kw_end: t.end,
                expr: Some((tokens[next].start, tokens[last_idx].end.min(expr_end))),
                stmt_end,
            },
        ));
    }

    Ok(ParsedModule {
        source: src,
        tokens,
        functions,
        calls,
        returns,
    })
}

fn is_directly_awaited(tokens: &[Token], callee_start: usize) -> bool {
    let mut i = callee_start;
    while i > 0 && tokens[i - 1].text == "(" {
        i -= 1;
    }
    i > 0 && matches!(tokens[i - 1].text, "await" | "yield")
}

fn is_returned_from_async(
    tokens: &[Token],
    callee_start: usize,
    functions: &[FunctionSite],
    _m: &Matches,
) -> bool {
    let mut i = callee_start;
    while i > 0 && tokens[i - 1].text == "(" {
        i -= 1;
    }
    if i == 0 || tokens[i - 1].text != "return" {
        return false;
    }
    let pos = tokens[callee_start].start;
    functions
        .iter()
        .filter(|f| f.contains(pos))
        .min_by_key(|f| f.body_close - f.body_open)
        .map(|f| f.is_async)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_function_declaration() {
        let m = parse("function add(a, b) {\n  return a + b;\n}").unwrap();
        assert_eq!(m.functions.len(), 1);
        let f = &m.functions[0];
        assert_eq!(f.declared_name.as_deref(), Some("add"));
        assert_eq!(f.params.len(), 2);
        assert_eq!(f.params[0].name.as_deref(), Some("a"));
    }

    #[test]
    fn parses_arrow_with_block_body() {
        let m = parse("const f = (x, y) => { return x + y; };").unwrap();
        assert_eq!(m.functions.len(), 1);
        assert!(m.functions[0].is_arrow);
        assert_eq!(m.functions[0].declared_name.as_deref(), Some("f"));
    }

    #[test]
    fn parses_arrow_with_expression_body() {
        let m = parse("const double = x => x * 2;").unwrap();
        assert_eq!(m.functions.len(), 1);
        assert!(m.functions[0].is_expression_body);
    }

    #[test]
    fn parses_method_shorthand_with_modifiers() {
        let m = parse("class C {\n  async fetchThing(id) {\n    return id;\n  }\n  get value() { return 1; }\n}").unwrap();
        assert_eq!(m.functions.len(), 2);
        assert!(m.functions.iter().any(|f| f.declared_name.as_deref() == Some("fetchThing") && f.is_async));
        assert!(m.functions.iter().any(|f| f.kind == FunctionKind::Getter));
    }

    #[test]
    fn finds_plain_and_member_call_sites() {
        let m = parse("foo(1, 2); obj.bar(3);").unwrap();
        assert_eq!(m.calls.len(), 2);
        assert_eq!(m.calls[0].label, "foo");
        assert!(m.calls[0].object_text.is_none());
        assert_eq!(m.calls[1].label, "bar");
        assert_eq!(m.calls[1].object_text.as_deref(), Some("obj"));
    }

    #[test]
    fn skips_new_super_and_optional_calls() {
        let m = parse("new Foo(); super(); maybe?.(1); import('x');").unwrap();
        assert!(m.calls.is_empty());
    }

    #[test]
    fn marks_awaited_calls_via_await_keyword() {
        let m = parse("async function f() { await g(); h(); }").unwrap();
        let g_call = m.calls.iter().find(|c| c.label == "g").unwrap();
        let h_call = m.calls.iter().find(|c| c.label == "h").unwrap();
        assert!(g_call.awaited);
        assert!(!h_call.awaited);
    }

    #[test]
    fn finds_return_statement_owned_by_innermost_function() {
        let m = parse("function outer() {\n  function inner() { return 1; }\n  return inner();\n}").unwrap();
        assert_eq!(m.returns.len(), 2);
    }

    #[test]
    fn bare_return_via_asi_has_no_expression() {
        let m = parse("function f() {\n  return\n  1;\n}").unwrap();
        assert_eq!(m.returns.len(), 1);
        assert!(m.returns[0].1.expr.is_none());
    }
}
