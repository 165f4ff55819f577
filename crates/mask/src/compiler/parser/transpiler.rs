//! Desugars Mask's syntax extensions into plain Lua source text.
//!
//! `emmylua_parser` (the CST the rest of `compiler/` builds bytecode from)
//! only understands Lua. Rather than fork that parser, source is run
//! through this token-stream transpiler first: compound assignment, walrus
//! declarations, `switch`/`case`/`default`, `continue`, `enum`, ternary,
//! `??`, `?.`/`?[`, `in`, lambdas and f-strings are all rewritten here into
//! their Lua equivalents (mostly via small `(function() ... end)()` wrappers
//! for anything that needs to short-circuit or bind a temporary), and type
//! hints are parsed and stripped. Everything else passes through unchanged.

use super::lua_language_level::LuaLanguageLevel;
use super::lua_token_data::LuaTokenData;
use super::lua_token_kind::LuaTokenKind;
use super::lua_tokenize::LuaTokenize;
use super::reader::Reader;
use super::tokenize_config::TokensizeConfig;

pub struct TranspileResult {
    pub source: String,
    pub warnings: Vec<String>,
}

pub fn transpile(source: &str, level: LuaLanguageLevel) -> Result<TranspileResult, String> {
    let tokens = tokenize_all(source, level)?;
    let mut parser = Transpiler::new(source, tokens, level);
    let out = parser.parse_chunk()?;
    Ok(TranspileResult {
        source: out,
        warnings: parser.warnings,
    })
}

fn tokenize_all(source: &str, level: LuaLanguageLevel) -> Result<Vec<LuaTokenData>, String> {
    let reader = Reader::new(source);
    let config = TokensizeConfig {
        language_level: level,
    };
    let mut lexer = LuaTokenize::new(reader, config);
    let tokens = lexer.tokenize()?;
    Ok(tokens.into_iter().filter(|t| !is_trivia(t.kind)).collect())
}

fn is_trivia(kind: LuaTokenKind) -> bool {
    matches!(
        kind,
        LuaTokenKind::TkShortComment
            | LuaTokenKind::TkLongComment
            | LuaTokenKind::TkEndOfLine
            | LuaTokenKind::TkWhitespace
            | LuaTokenKind::TkShebang
    )
}

struct Transpiler<'a> {
    text: &'a str,
    tokens: Vec<LuaTokenData>,
    pos: usize,
    level: LuaLanguageLevel,
    loop_labels: Vec<String>,
    label_counter: usize,
    warnings: Vec<String>,
}

use LuaTokenKind::*;

impl<'a> Transpiler<'a> {
    fn new(text: &'a str, tokens: Vec<LuaTokenData>, level: LuaLanguageLevel) -> Self {
        Transpiler {
            text,
            tokens,
            pos: 0,
            level,
            loop_labels: Vec::new(),
            label_counter: 0,
            warnings: Vec::new(),
        }
    }

    fn cur(&self) -> LuaTokenKind {
        self.tokens.get(self.pos).map(|t| t.kind).unwrap_or(TkEof)
    }

    fn peek(&self, n: usize) -> LuaTokenKind {
        self.tokens
            .get(self.pos + n)
            .map(|t| t.kind)
            .unwrap_or(TkEof)
    }

    fn cur_text(&self) -> &'a str {
        match self.tokens.get(self.pos) {
            Some(t) => &self.text[t.range.start_offset..t.range.end_offset()],
            None => "",
        }
    }

    fn bump(&mut self) -> &'a str {
        let text = self.cur_text();
        self.pos += 1;
        text
    }

    fn expect(&mut self, kind: LuaTokenKind) -> Result<&'a str, String> {
        if self.cur() == kind {
            Ok(self.bump())
        } else {
            Err(format!(
                "expected {:?}, found {:?} ('{}')",
                kind,
                self.cur(),
                self.cur_text()
            ))
        }
    }

    fn next_label(&mut self) -> String {
        self.label_counter += 1;
        format!("__mask_continue{}", self.label_counter)
    }

    fn next_temp(&mut self, tag: &str) -> String {
        self.label_counter += 1;
        format!("__mask_{}{}", tag, self.label_counter)
    }

    // ---- statements ----

    fn parse_chunk(&mut self) -> Result<String, String> {
        let mut out = String::new();
        while self.cur() != TkEof {
            let stmt = self.parse_statement()?;
            if !stmt.is_empty() {
                out.push_str(&stmt);
                out.push('\n');
            }
        }
        Ok(out)
    }

    fn parse_block_until(&mut self, enders: &[LuaTokenKind]) -> Result<String, String> {
        let mut out = String::new();
        while !enders.contains(&self.cur()) && self.cur() != TkEof {
            let stmt = self.parse_statement()?;
            if !stmt.is_empty() {
                out.push_str(&stmt);
                out.push('\n');
            }
        }
        Ok(out)
    }

    fn parse_statement(&mut self) -> Result<String, String> {
        match self.cur() {
            TkSemicolon => {
                self.bump();
                Ok(String::new())
            }
            TkIf => self.parse_if(),
            TkWhile => self.parse_while(),
            TkFor => self.parse_for(),
            TkRepeat => self.parse_repeat(),
            TkDo => {
                self.bump();
                let body = self.parse_block_until(&[TkEnd])?;
                self.expect(TkEnd)?;
                Ok(format!("do\n{}\nend", body))
            }
            TkFunction => self.parse_function_stat(),
            TkLocal => self.parse_local_stat(),
            TkGlobal => self.parse_global_stat(),
            TkReturn => self.parse_return(),
            TkBreak => {
                self.bump();
                Ok("break".to_string())
            }
            TkContinue => self.parse_continue(),
            TkGoto => {
                self.bump();
                let name = self.expect(TkName)?.to_string();
                Ok(format!("goto {}", name))
            }
            TkDbColon => {
                self.bump();
                let name = self.expect(TkName)?.to_string();
                self.expect(TkDbColon)?;
                Ok(format!("::{}::", name))
            }
            TkSwitch => self.parse_switch(),
            TkEnum => self.parse_enum(),
            TkPlus if self.peek(1) == TkPlus => self.parse_prefix_increment_stat(),
            _ => self.parse_expr_or_assign_stat(),
        }
    }

    fn parse_if(&mut self) -> Result<String, String> {
        self.expect(TkIf)?;
        let cond = self.parse_expr()?;
        self.expect(TkThen)?;
        let mut out = format!("if ({}) then\n", cond);
        out.push_str(&self.parse_block_until(&[TkElseIf, TkElse, TkEnd])?);

        while self.cur() == TkElseIf {
            self.bump();
            let c = self.parse_expr()?;
            self.expect(TkThen)?;
            out.push_str(&format!("elseif ({}) then\n", c));
            out.push_str(&self.parse_block_until(&[TkElseIf, TkElse, TkEnd])?);
        }

        if self.cur() == TkElse {
            self.bump();
            out.push_str("else\n");
            out.push_str(&self.parse_block_until(&[TkEnd])?);
        }

        self.expect(TkEnd)?;
        out.push_str("end");
        Ok(out)
    }

    fn parse_while(&mut self) -> Result<String, String> {
        self.expect(TkWhile)?;
        let cond = self.parse_expr()?;
        self.expect(TkDo)?;
        let label = self.next_label();
        self.loop_labels.push(label.clone());
        let body = self.parse_block_until(&[TkEnd]);
        self.loop_labels.pop();
        let body = body?;
        self.expect(TkEnd)?;
        Ok(format!(
            "while ({}) do\n{}\n::{}::\nend",
            cond, body, label
        ))
    }

    fn parse_repeat(&mut self) -> Result<String, String> {
        self.expect(TkRepeat)?;
        let label = self.next_label();
        self.loop_labels.push(label.clone());
        let body = self.parse_block_until(&[TkUntil]);
        self.loop_labels.pop();
        let body = body?;
        self.expect(TkUntil)?;
        let cond = self.parse_expr()?;
        Ok(format!(
            "repeat\n{}\n::{}::\nuntil ({})",
            body, label, cond
        ))
    }

    fn parse_for(&mut self) -> Result<String, String> {
        self.expect(TkFor)?;
        let first_name = self.parse_name_with_optional_hint()?;

        if self.cur() == TkAssign {
            self.bump();
            let start = self.parse_expr()?;
            self.expect(TkComma)?;
            let stop = self.parse_expr()?;
            let step = if self.cur() == TkComma {
                self.bump();
                Some(self.parse_expr()?)
            } else {
                None
            };
            self.expect(TkDo)?;
            let label = self.next_label();
            self.loop_labels.push(label.clone());
            let body = self.parse_block_until(&[TkEnd]);
            self.loop_labels.pop();
            let body = body?;
            self.expect(TkEnd)?;
            let header = match step {
                Some(s) => format!(
                    "for {} = ({}), ({}), ({}) do",
                    first_name, start, stop, s
                ),
                None => format!("for {} = ({}), ({}) do", first_name, start, stop),
            };
            Ok(format!("{}\n{}\n::{}::\nend", header, body, label))
        } else {
            let mut names = vec![first_name];
            while self.cur() == TkComma {
                self.bump();
                names.push(self.parse_name_with_optional_hint()?);
            }
            self.expect(TkIn)?;
            let mut exprs = vec![self.parse_expr()?];
            while self.cur() == TkComma {
                self.bump();
                exprs.push(self.parse_expr()?);
            }
            self.expect(TkDo)?;
            let label = self.next_label();
            self.loop_labels.push(label.clone());
            let body = self.parse_block_until(&[TkEnd]);
            self.loop_labels.pop();
            let body = body?;
            self.expect(TkEnd)?;
            Ok(format!(
                "for {} in {} do\n{}\n::{}::\nend",
                names.join(", "),
                exprs.join(", "),
                body,
                label
            ))
        }
    }

    fn parse_function_stat(&mut self) -> Result<String, String> {
        self.expect(TkFunction)?;
        let mut name = self.expect(TkName)?.to_string();
        let mut is_method = false;
        loop {
            if self.cur() == TkDot {
                self.bump();
                name.push('.');
                name.push_str(self.expect(TkName)?);
            } else if self.cur() == TkColon {
                self.bump();
                name.push(':');
                name.push_str(self.expect(TkName)?);
                is_method = true;
                break;
            } else {
                break;
            }
        }
        let (params, body) = self.parse_function_body(is_method)?;
        Ok(format!("function {}({})\n{}\nend", name, params, body))
    }

    fn parse_function_body(&mut self, is_method: bool) -> Result<(String, String), String> {
        self.expect(TkLeftParen)?;
        let mut params = Vec::new();
        if is_method {
            params.push("self".to_string());
        }
        if self.cur() != TkRightParen {
            loop {
                if self.cur() == TkDots {
                    self.bump();
                    params.push("...".to_string());
                    break;
                }
                params.push(self.parse_name_with_optional_hint()?);
                if self.cur() == TkComma {
                    self.bump();
                } else {
                    break;
                }
            }
        }
        self.expect(TkRightParen)?;
        if self.cur() == TkColon {
            self.bump();
            self.skip_type_expr()?;
        }
        let body = self.parse_block_until(&[TkEnd])?;
        self.expect(TkEnd)?;
        Ok((params.join(", "), body))
    }

    fn parse_local_stat(&mut self) -> Result<String, String> {
        self.expect(TkLocal)?;
        if self.cur() == TkFunction {
            self.bump();
            let name = self.expect(TkName)?.to_string();
            let (params, body) = self.parse_function_body(false)?;
            return Ok(format!(
                "local function {}({})\n{}\nend",
                name, params, body
            ));
        }

        let mut names = vec![self.parse_local_name()?];
        while self.cur() == TkComma {
            self.bump();
            names.push(self.parse_local_name()?);
        }

        if self.cur() == TkAssign {
            self.bump();
            let mut exprs = vec![self.parse_expr()?];
            while self.cur() == TkComma {
                self.bump();
                exprs.push(self.parse_expr()?);
            }
            Ok(format!("local {} = {}", names.join(", "), exprs.join(", ")))
        } else {
            Ok(format!("local {}", names.join(", ")))
        }
    }

    fn parse_global_stat(&mut self) -> Result<String, String> {
        self.expect(TkGlobal)?;
        let mut names = vec![self.parse_local_name()?];
        while self.cur() == TkComma {
            self.bump();
            names.push(self.parse_local_name()?);
        }
        if self.cur() == TkAssign {
            self.bump();
            let mut exprs = vec![self.parse_expr()?];
            while self.cur() == TkComma {
                self.bump();
                exprs.push(self.parse_expr()?);
            }
            Ok(format!("global {} = {}", names.join(", "), exprs.join(", ")))
        } else {
            Ok(format!("global {}", names.join(", ")))
        }
    }

    fn parse_local_name(&mut self) -> Result<String, String> {
        let name = self.expect(TkName)?.to_string();
        self.skip_type_hint()?;
        if self.cur() == TkLt {
            self.bump();
            let attrib = self.expect(TkName)?.to_string();
            self.expect(TkGt)?;
            Ok(format!("{}<{}>", name, attrib))
        } else {
            Ok(name)
        }
    }

    fn parse_name_with_optional_hint(&mut self) -> Result<String, String> {
        let name = self.expect(TkName)?.to_string();
        self.skip_type_hint()?;
        Ok(name)
    }

    fn skip_type_hint(&mut self) -> Result<(), String> {
        if self.cur() == TkColon {
            self.bump();
            self.skip_type_expr()?;
        }
        Ok(())
    }

    fn skip_type_expr(&mut self) -> Result<(), String> {
        self.expect(TkName)?;
        while self.cur() == TkDot {
            self.bump();
            self.expect(TkName)?;
        }
        if self.cur() == TkQuestion {
            self.bump();
        }
        while self.cur() == TkLeftBracket && self.peek(1) == TkRightBracket {
            self.bump();
            self.bump();
        }
        Ok(())
    }

    fn parse_return(&mut self) -> Result<String, String> {
        self.expect(TkReturn)?;
        if matches!(
            self.cur(),
            TkEnd | TkElse | TkElseIf | TkUntil | TkEof | TkSemicolon | TkCase | TkDefault
        ) {
            if self.cur() == TkSemicolon {
                self.bump();
            }
            return Ok("return".to_string());
        }
        let mut exprs = vec![self.parse_expr()?];
        while self.cur() == TkComma {
            self.bump();
            exprs.push(self.parse_expr()?);
        }
        if self.cur() == TkSemicolon {
            self.bump();
        }
        Ok(format!("return {}", exprs.join(", ")))
    }

    fn parse_continue(&mut self) -> Result<String, String> {
        self.expect(TkContinue)?;
        let mut level = 1usize;
        if self.cur() == TkInt {
            level = self.bump().parse::<usize>().unwrap_or(1).max(1);
        }
        if self.cur() == TkSemicolon {
            self.bump();
        }
        if self.loop_labels.is_empty() {
            return Err("'continue' used outside of a loop".to_string());
        }
        let idx = self.loop_labels.len().saturating_sub(level);
        let label = self.loop_labels[idx].clone();
        Ok(format!("goto {}", label))
    }

    fn parse_prefix_increment_stat(&mut self) -> Result<String, String> {
        self.expect(TkPlus)?;
        self.expect(TkPlus)?;
        let lvalue = self.parse_suffixed_expr()?;
        Ok(format!("{} = ({}) + 1", lvalue, lvalue))
    }

    fn parse_switch(&mut self) -> Result<String, String> {
        self.expect(TkSwitch)?;
        let subject = self.parse_expr()?;
        if self.cur() == TkDo {
            self.bump();
        }
        let tmp = self.next_temp("switch");
        let mut out = format!("local {} = ({})\n", tmp, subject);

        let mut clauses: Vec<(String, String)> = Vec::new();
        while self.cur() == TkCase {
            self.bump();
            let mut conds = vec![self.parse_expr()?];
            while self.cur() == TkComma {
                self.bump();
                conds.push(self.parse_expr()?);
            }
            let mut cond_text = conds
                .iter()
                .map(|c| format!("{} == ({})", tmp, c))
                .collect::<Vec<_>>()
                .join(" or ");
            if self.cur() == TkWhen {
                self.bump();
                let guard = self.parse_expr()?;
                cond_text = format!("({}) and ({})", cond_text, guard);
            }
            self.expect(TkColon)?;
            let body = self.parse_block_until(&[TkCase, TkDefault, TkEnd])?;
            clauses.push((cond_text, body));
        }

        let default_body = if self.cur() == TkDefault {
            self.bump();
            self.expect(TkColon)?;
            Some(self.parse_block_until(&[TkEnd])?)
        } else {
            None
        };
        self.expect(TkEnd)?;

        if clauses.is_empty() {
            if let Some(body) = default_body {
                out.push_str("do\n");
                out.push_str(&body);
                out.push_str("\nend");
            }
            return Ok(out);
        }

        for (i, (cond, body)) in clauses.iter().enumerate() {
            out.push_str(if i == 0 { "if (" } else { "elseif (" });
            out.push_str(cond);
            out.push_str(") then\n");
            out.push_str(body);
            out.push('\n');
        }
        if let Some(body) = default_body {
            out.push_str("else\n");
            out.push_str(&body);
            out.push('\n');
        }
        out.push_str("end");
        Ok(out)
    }

    fn parse_enum(&mut self) -> Result<String, String> {
        self.expect(TkEnum)?;
        let name = self.expect(TkName)?.to_string();
        self.expect(TkLeftBrace)?;
        let mut entries = Vec::new();
        let mut next_value: i64 = 1;
        while self.cur() != TkRightBrace {
            let member = self.expect(TkName)?.to_string();
            let value = if self.cur() == TkAssign {
                self.bump();
                self.parse_expr()?
            } else {
                next_value.to_string()
            };
            next_value = value.parse::<i64>().map(|n| n + 1).unwrap_or(next_value + 1);
            entries.push(format!("{} = {}", member, value));
            if self.cur() == TkComma {
                self.bump();
            } else {
                break;
            }
        }
        self.expect(TkRightBrace)?;
        Ok(format!("local {} = freeze({{ {} }})", name, entries.join(", ")))
    }

    fn parse_expr_or_assign_stat(&mut self) -> Result<String, String> {
        if self.cur() == TkName && self.peek(1) == TkWalrus {
            let name = self.bump().to_string();
            self.expect(TkWalrus)?;
            let expr = self.parse_expr()?;
            return Ok(format!("local {} = {}", name, expr));
        }

        let first = self.parse_suffixed_expr()?;

        if self.cur() == TkNilCoalesceEq {
            self.bump();
            let rhs = self.parse_expr()?;
            return Ok(format!(
                "if ({}) == nil then {} = ({}) end",
                first, first, rhs
            ));
        }

        if let Some(op) = compound_op_text(self.cur()) {
            self.bump();
            let rhs = self.parse_expr()?;
            return Ok(format!("{} = ({}) {} ({})", first, first, op, rhs));
        }

        if self.cur() == TkAssign || self.cur() == TkComma {
            let mut targets = vec![first];
            while self.cur() == TkComma {
                self.bump();
                targets.push(self.parse_suffixed_expr()?);
            }
            self.expect(TkAssign)?;
            let mut exprs = vec![self.parse_expr()?];
            while self.cur() == TkComma {
                self.bump();
                exprs.push(self.parse_expr()?);
            }
            return Ok(format!("{} = {}", targets.join(", "), exprs.join(", ")));
        }

        Ok(first)
    }

    // ---- expressions, lowest to highest precedence ----

    fn parse_expr(&mut self) -> Result<String, String> {
        self.parse_coalesce()
    }

    fn parse_coalesce(&mut self) -> Result<String, String> {
        let mut left = self.parse_ternary()?;
        while self.cur() == TkNilCoalesce {
            self.bump();
            let right = self.parse_ternary()?;
            let v = self.next_temp("nc");
            left = format!(
                "(function() local {v} = ({left}); if {v} ~= nil then return {v} else return ({right}) end end)()",
                v = v,
                left = left,
                right = right
            );
        }
        Ok(left)
    }

    fn parse_ternary(&mut self) -> Result<String, String> {
        let cond = self.parse_or()?;
        if self.cur() == TkQuestion {
            self.bump();
            let then_e = self.parse_expr()?;
            self.expect(TkColon)?;
            let else_e = self.parse_expr()?;
            Ok(format!(
                "(function() if ({}) then return ({}) else return ({}) end end)()",
                cond, then_e, else_e
            ))
        } else {
            Ok(cond)
        }
    }

    fn parse_or(&mut self) -> Result<String, String> {
        let mut left = self.parse_and()?;
        while self.cur() == TkOr {
            self.bump();
            let right = self.parse_and()?;
            left = format!("({} or {})", left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<String, String> {
        let mut left = self.parse_in()?;
        while self.cur() == TkAnd {
            self.bump();
            let right = self.parse_in()?;
            left = format!("({} and {})", left, right);
        }
        Ok(left)
    }

    fn parse_in(&mut self) -> Result<String, String> {
        let mut left = self.parse_cmp()?;
        while self.cur() == TkIn {
            self.bump();
            let right = self.parse_cmp()?;
            left = format!("__mask_in(({}), ({}))", left, right);
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> Result<String, String> {
        let mut left = self.parse_bor()?;
        loop {
            let op = match self.cur() {
                TkEq => "==",
                TkNe => "~=",
                TkLt => "<",
                TkGt => ">",
                TkLe => "<=",
                TkGe => ">=",
                _ => break,
            };
            self.bump();
            let right = self.parse_bor()?;
            left = format!("({} {} {})", left, op, right);
        }
        Ok(left)
    }

    fn parse_bor(&mut self) -> Result<String, String> {
        let mut left = self.parse_bxor()?;
        while self.cur() == TkBitOr {
            self.bump();
            let right = self.parse_bxor()?;
            left = format!("({} | {})", left, right);
        }
        Ok(left)
    }

    fn parse_bxor(&mut self) -> Result<String, String> {
        let mut left = self.parse_band()?;
        while self.cur() == TkBitXor {
            self.bump();
            let right = self.parse_band()?;
            left = format!("({} ~ {})", left, right);
        }
        Ok(left)
    }

    fn parse_band(&mut self) -> Result<String, String> {
        let mut left = self.parse_shift()?;
        while self.cur() == TkBitAnd {
            self.bump();
            let right = self.parse_shift()?;
            left = format!("({} & {})", left, right);
        }
        Ok(left)
    }

    fn parse_shift(&mut self) -> Result<String, String> {
        let mut left = self.parse_concat()?;
        loop {
            let op = match self.cur() {
                TkShl => "<<",
                TkShr => ">>",
                _ => break,
            };
            self.bump();
            let right = self.parse_concat()?;
            left = format!("({} {} {})", left, op, right);
        }
        Ok(left)
    }

    fn parse_concat(&mut self) -> Result<String, String> {
        let left = self.parse_additive()?;
        if self.cur() == TkConcat {
            self.bump();
            let right = self.parse_concat()?;
            Ok(format!("({} .. {})", left, right))
        } else {
            Ok(left)
        }
    }

    fn parse_additive(&mut self) -> Result<String, String> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.cur() {
                TkPlus => "+",
                TkMinus => "-",
                _ => break,
            };
            self.bump();
            let right = self.parse_multiplicative()?;
            left = format!("({} {} {})", left, op, right);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<String, String> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.cur() {
                TkMul => "*",
                TkDiv => "/",
                TkIDiv => "//",
                TkMod => "%",
                _ => break,
            };
            self.bump();
            let right = self.parse_unary()?;
            left = format!("({} {} {})", left, op, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<String, String> {
        let op = match self.cur() {
            TkNot => "not ",
            TkMinus => "-",
            TkLen => "#",
            TkBitXor => "~",
            _ => return self.parse_pow(),
        };
        self.bump();
        let operand = self.parse_unary()?;
        Ok(format!("({}{})", op, operand))
    }

    fn parse_pow(&mut self) -> Result<String, String> {
        let base = self.parse_postfix()?;
        if self.cur() == TkPow {
            self.bump();
            let right = self.parse_unary()?;
            Ok(format!("({} ^ {})", base, right))
        } else {
            Ok(base)
        }
    }

    fn parse_suffixed_expr(&mut self) -> Result<String, String> {
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<String, String> {
        let mut base = self.parse_primary()?;
        loop {
            match self.cur() {
                TkDot => {
                    self.bump();
                    let name = self.expect(TkName)?.to_string();
                    base = format!("{}.{}", base, name);
                }
                TkSafeDot => {
                    self.bump();
                    let name = self.expect(TkName)?.to_string();
                    let v = self.next_temp("sn");
                    base = format!(
                        "(function() local {v} = ({base}); if {v} == nil then return nil else return {v}.{name} end end)()",
                        v = v,
                        base = base,
                        name = name
                    );
                }
                TkLeftBracket => {
                    self.bump();
                    let idx = self.parse_expr()?;
                    self.expect(TkRightBracket)?;
                    base = format!("{}[{}]", base, idx);
                }
                TkSafeBracket => {
                    self.bump();
                    let idx = self.parse_expr()?;
                    self.expect(TkRightBracket)?;
                    let v = self.next_temp("sn");
                    base = format!(
                        "(function() local {v} = ({base}); if {v} == nil then return nil else return {v}[{idx}] end end)()",
                        v = v,
                        base = base,
                        idx = idx
                    );
                }
                TkColon => {
                    self.bump();
                    let name = self.expect(TkName)?.to_string();
                    let args = self.parse_call_args()?;
                    base = format!("{}:{}({})", base, name, args);
                }
                TkLeftParen | TkString | TkLongString | TkFString | TkLeftBrace => {
                    let args = self.parse_call_args()?;
                    base = format!("{}({})", base, args);
                }
                TkAs => {
                    self.bump();
                    self.skip_type_expr()?;
                }
                _ => break,
            }
        }
        Ok(base)
    }

    fn parse_call_args(&mut self) -> Result<String, String> {
        match self.cur() {
            TkLeftParen => {
                self.bump();
                let mut args = Vec::new();
                if self.cur() != TkRightParen {
                    args.push(self.parse_expr()?);
                    while self.cur() == TkComma {
                        self.bump();
                        args.push(self.parse_expr()?);
                    }
                }
                self.expect(TkRightParen)?;
                Ok(args.join(", "))
            }
            TkString | TkLongString | TkFString => self.parse_primary(),
            TkLeftBrace => self.parse_table_ctor(),
            other => Err(format!("expected call arguments, found {:?}", other)),
        }
    }

    fn parse_table_ctor(&mut self) -> Result<String, String> {
        self.expect(TkLeftBrace)?;
        let mut fields = Vec::new();
        while self.cur() != TkRightBrace {
            let field = if self.cur() == TkLeftBracket {
                self.bump();
                let key = self.parse_expr()?;
                self.expect(TkRightBracket)?;
                self.expect(TkAssign)?;
                let val = self.parse_expr()?;
                format!("[{}] = {}", key, val)
            } else if self.cur() == TkName && self.peek(1) == TkAssign {
                let name = self.bump().to_string();
                self.expect(TkAssign)?;
                let val = self.parse_expr()?;
                format!("{} = {}", name, val)
            } else {
                self.parse_expr()?
            };
            fields.push(field);
            if matches!(self.cur(), TkComma | TkSemicolon) {
                self.bump();
            } else {
                break;
            }
        }
        self.expect(TkRightBrace)?;
        Ok(format!("{{ {} }}", fields.join(", ")))
    }

    fn parse_lambda(&mut self) -> Result<String, String> {
        self.expect(TkBitOr)?;
        let mut params = Vec::new();
        if self.cur() != TkBitOr {
            loop {
                params.push(self.parse_name_with_optional_hint()?);
                if self.cur() == TkComma {
                    self.bump();
                } else {
                    break;
                }
            }
        }
        self.expect(TkBitOr)?;
        self.expect(TkArrow)?;
        if self.cur() == TkBegin {
            self.bump();
            let body = self.parse_block_until(&[TkEnd])?;
            self.expect(TkEnd)?;
            Ok(format!("(function({})\n{}\nend)", params.join(", "), body))
        } else {
            let expr = self.parse_expr()?;
            Ok(format!(
                "(function({}) return ({}) end)",
                params.join(", "),
                expr
            ))
        }
    }

    fn parse_primary(&mut self) -> Result<String, String> {
        match self.cur() {
            TkNil => {
                self.bump();
                Ok("nil".to_string())
            }
            TkTrue => {
                self.bump();
                Ok("true".to_string())
            }
            TkFalse => {
                self.bump();
                Ok("false".to_string())
            }
            TkInt | TkFloat | TkComplex => Ok(self.bump().to_string()),
            TkDots => {
                self.bump();
                Ok("...".to_string())
            }
            TkString | TkLongString => Ok(normalize_string_literal(self.bump())),
            TkFString => {
                let text = self.bump();
                self.transpile_fstring(text)
            }
            TkName => Ok(self.bump().to_string()),
            TkLeftParen => {
                self.bump();
                let inner = self.parse_expr()?;
                self.expect(TkRightParen)?;
                Ok(format!("({})", inner))
            }
            TkLeftBrace => self.parse_table_ctor(),
            TkFunction => {
                self.bump();
                let (params, body) = self.parse_function_body(false)?;
                Ok(format!("(function({})\n{}\nend)", params, body))
            }
            TkBitOr => self.parse_lambda(),
            other => Err(format!(
                "unexpected token {:?} ('{}')",
                other,
                self.cur_text()
            )),
        }
    }

    fn transpile_fstring(&mut self, token_text: &str) -> Result<String, String> {
        let inner = token_text
            .strip_prefix("$\"")
            .and_then(|s| s.strip_suffix('"'))
            .ok_or_else(|| "malformed f-string literal".to_string())?;

        let chars: Vec<char> = inner.chars().collect();
        let mut i = 0;
        let mut segments: Vec<String> = Vec::new();
        let mut literal = String::new();

        while i < chars.len() {
            match chars[i] {
                '\\' if i + 1 < chars.len() => {
                    literal.push(chars[i]);
                    literal.push(chars[i + 1]);
                    i += 2;
                }
                '{' if i + 1 < chars.len() && chars[i + 1] == '{' => {
                    literal.push('{');
                    i += 2;
                }
                '}' if i + 1 < chars.len() && chars[i + 1] == '}' => {
                    literal.push('}');
                    i += 2;
                }
                '{' => {
                    if !literal.is_empty() {
                        segments.push(format!("\"{}\"", literal));
                        literal = String::new();
                    }
                    let mut depth = 1;
                    i += 1;
                    let start = i;
                    while i < chars.len() && depth > 0 {
                        match chars[i] {
                            '{' | '(' | '[' => depth += 1,
                            '}' | ')' | ']' => depth -= 1,
                            _ => {}
                        }
                        if depth > 0 {
                            i += 1;
                        }
                    }
                    let expr_src: String = chars[start..i].iter().collect();
                    i += 1; // consume the matching '}'
                    let transpiled = transpile_expr_fragment(&expr_src, self.level)?;
                    segments.push(format!("tostring({})", transpiled));
                }
                ch => {
                    literal.push(ch);
                    i += 1;
                }
            }
        }
        if !literal.is_empty() {
            segments.push(format!("\"{}\"", literal));
        }
        if segments.is_empty() {
            Ok("\"\"".to_string())
        } else {
            Ok(format!("({})", segments.join(" .. ")))
        }
    }
}

fn transpile_expr_fragment(src: &str, level: LuaLanguageLevel) -> Result<String, String> {
    let tokens = tokenize_all(src, level)?;
    let mut p = Transpiler::new(src, tokens, level);
    p.parse_expr()
}

fn compound_op_text(kind: LuaTokenKind) -> Option<&'static str> {
    Some(match kind {
        TkPlusEq => "+",
        TkMinusEq => "-",
        TkMulEq => "*",
        TkDivEq => "/",
        TkIDivEq => "//",
        TkModEq => "%",
        TkPowEq => "^",
        TkConcatEq => "..",
        TkBitAndEq => "&",
        TkBitOrEq => "|",
        TkBitXorEq => "~",
        TkShlEq => "<<",
        TkShrEq => ">>",
        _ => return None,
    })
}

/// Backtick strings (a pre-existing lexer extension) re-rendered as
/// standard Lua double-quoted strings.
fn normalize_string_literal(text: &str) -> String {
    let Some(inner) = text.strip_prefix('`').and_then(|s| s.strip_suffix('`')) else {
        return text.to_string();
    };
    let mut out = String::from("\"");
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                out.push('\\');
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '"' => out.push_str("\\\""),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}
