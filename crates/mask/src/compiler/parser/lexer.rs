use super::error::LuaParseError;
use super::lexer_config::LexerConfig;
use super::lua_token_data::LuaTokenData;
use super::lua_tokenize::{LuaTokenize, WarningDirective};
use super::reader::Reader;
use super::tokenize_config::TokensizeConfig;

/// Thin adapter wiring `LuaTokenize`'s scanning into the error-vec-threading
/// interface `LuaParser` expects: collects a fatal scan error (if any) into
/// the caller's error list instead of returning a `Result`.
pub struct LuaLexer<'a, 'e> {
    tokenize: LuaTokenize<'a>,
    errors: Option<&'e mut Vec<LuaParseError>>,
}

impl<'a, 'e> LuaLexer<'a, 'e> {
    pub fn new(
        reader: Reader<'a>,
        lexer_config: LexerConfig,
        errors: Option<&'e mut Vec<LuaParseError>>,
    ) -> Self {
        let tokenize_config = TokensizeConfig {
            language_level: lexer_config.language_level,
        };
        LuaLexer {
            tokenize: LuaTokenize::new(reader, tokenize_config),
            errors,
        }
    }

    pub fn tokenize(&mut self) -> Vec<LuaTokenData> {
        match self.tokenize.tokenize() {
            Ok(tokens) => tokens,
            Err(message) => {
                if let Some(errors) = self.errors.as_deref_mut() {
                    errors.push(LuaParseError::syntax_error_from(
                        &message,
                        super::text_range::SourceRange::EMPTY,
                    ));
                }
                Vec::new()
            }
        }
    }

    pub fn warning_directives(&self) -> &[WarningDirective] {
        self.tokenize.warning_directives()
    }
}
