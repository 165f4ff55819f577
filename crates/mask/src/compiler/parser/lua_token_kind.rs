use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum LuaTokenKind {
    None,
    // KeyWord
    TkAnd,
    TkBreak,
    TkDo,
    TkElse,
    TkElseIf,
    TkEnd,
    TkFalse,
    TkFor,
    TkFunction,
    TkGlobal,
    TkGoto,
    TkIf,
    TkIn,
    TkLocal,
    TkNil,
    TkNot,
    TkOr,
    TkRepeat,
    TkReturn,
    TkThen,
    TkTrue,
    TkUntil,
    TkWhile,

    // Mask keywords
    TkSwitch,
    TkCase,
    TkDefault,
    TkContinue,
    TkWhen,
    TkEnum,
    TkAs,
    TkBegin,

    TkWhitespace, // whitespace
    TkEndOfLine,  // end of line
    TkPlus,       // +
    TkMinus,      // -
    TkMul,        // *
    TkDiv,        // /
    TkIDiv,       // //
    TkDot,        // .
    TkConcat,     // ..
    TkDots,       // ...
    TkComma,      // ,
    TkAssign,     // =
    TkEq,         // ==
    TkGe,         // >=
    TkLe,         // <=
    TkNe,         // ~=
    TkShl,        // <<
    TkShr,        // >>
    TkLt,         // <
    TkGt,         // >
    TkMod,        // %
    TkPow,        // ^ (also reachable as `**`)
    TkLen,        // #
    TkBitAnd,     // &
    TkBitOr,      // |
    TkBitXor,     // ~
    TkColon,      // :
    TkDbColon,    // ::
    TkSemicolon,  // ;

    // Mask operators
    TkWalrus,        // :=
    TkNilCoalesce,   // ??
    TkNilCoalesceEq, // ??=
    TkQuestion,      // ?
    TkSafeDot,       // ?.
    TkSafeBracket,   // ?[
    TkArrow,         // -> (lambda body; `|params|` reuses TkBitOr as the delimiter)
    TkPlusEq,        // +=
    TkMinusEq,       // -=
    TkMulEq,         // *=
    TkDivEq,         // /=
    TkIDivEq,        // //=
    TkModEq,         // %=
    TkPowEq,         // ^=
    TkConcatEq,      // ..=
    TkBitAndEq,      // &=
    TkBitOrEq,       // |=
    TkBitXorEq,      // ^^= (Mask spelling for bitwise-xor compound assign)
    TkShlEq,         // <<=
    TkShrEq,         // >>=

    TkLeftBracket,  // [
    TkRightBracket, // ]
    TkLeftParen,    // (
    TkRightParen,   // )
    TkLeftBrace,    // {
    TkRightBrace,   // }
    TkComplex,      // complex
    TkInt,          // int
    TkFloat,        // float

    TkName,           // name
    TkString,         // string
    TkLongString,     // long string
    TkFString,        // $"... with {expr} interpolation segments
    TkShortComment,   // short comment
    TkLongComment,    // long comment
    TkShebang,        // shebang
    TkEof,            // eof

    TkUnknown, // unknown
}

impl fmt::Display for LuaTokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl LuaTokenKind {
    pub fn is_keyword(self) -> bool {
        matches!(
            self,
            LuaTokenKind::TkAnd
                | LuaTokenKind::TkBreak
                | LuaTokenKind::TkDo
                | LuaTokenKind::TkElse
                | LuaTokenKind::TkElseIf
                | LuaTokenKind::TkEnd
                | LuaTokenKind::TkFalse
                | LuaTokenKind::TkFor
                | LuaTokenKind::TkFunction
                | LuaTokenKind::TkGlobal
                | LuaTokenKind::TkGoto
                | LuaTokenKind::TkIf
                | LuaTokenKind::TkIn
                | LuaTokenKind::TkLocal
                | LuaTokenKind::TkNil
                | LuaTokenKind::TkNot
                | LuaTokenKind::TkOr
                | LuaTokenKind::TkRepeat
                | LuaTokenKind::TkReturn
                | LuaTokenKind::TkThen
                | LuaTokenKind::TkTrue
                | LuaTokenKind::TkUntil
                | LuaTokenKind::TkWhile
                | LuaTokenKind::TkSwitch
                | LuaTokenKind::TkCase
                | LuaTokenKind::TkDefault
                | LuaTokenKind::TkContinue
                | LuaTokenKind::TkWhen
                | LuaTokenKind::TkEnum
                | LuaTokenKind::TkAs
                | LuaTokenKind::TkBegin
        )
    }

    /// True for the family of `op=` compound-assignment tokens (`x += e`
    /// lowers to `x = x op e` at the statement level).
    pub fn compound_assign_op(self) -> Option<LuaTokenKind> {
        use LuaTokenKind::*;
        Some(match self {
            TkPlusEq => TkPlus,
            TkMinusEq => TkMinus,
            TkMulEq => TkMul,
            TkDivEq => TkDiv,
            TkIDivEq => TkIDiv,
            TkModEq => TkMod,
            TkPowEq => TkPow,
            TkConcatEq => TkConcat,
            TkBitAndEq => TkBitAnd,
            TkBitOrEq => TkBitOr,
            TkBitXorEq => TkBitXor,
            TkShlEq => TkShl,
            TkShrEq => TkShr,
            TkNilCoalesceEq => TkNilCoalesce,
            _ => return None,
        })
    }
}
