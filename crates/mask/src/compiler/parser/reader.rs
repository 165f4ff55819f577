use super::text_range::SourceRange;

/// Character-at-a-time cursor over source text, tracking byte offsets so
/// tokens can be sliced back out of the original `&str` without copying.
pub struct Reader<'a> {
    text: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
    buff_start: usize,
}

impl<'a> Reader<'a> {
    pub fn new(text: &'a str) -> Self {
        let chars: Vec<(usize, char)> = text.char_indices().collect();
        Reader {
            text,
            chars,
            pos: 0,
            buff_start: 0,
        }
    }

    fn byte_offset(&self, index: usize) -> usize {
        self.chars
            .get(index)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.text.len())
    }

    pub fn current_char(&self) -> char {
        self.chars.get(self.pos).map(|(_, ch)| *ch).unwrap_or('\0')
    }

    pub fn next_char(&self) -> char {
        self.chars
            .get(self.pos + 1)
            .map(|(_, ch)| *ch)
            .unwrap_or('\0')
    }

    pub fn bump(&mut self) {
        if self.pos < self.chars.len() {
            self.pos += 1;
        }
    }

    pub fn is_eof(&self) -> bool {
        self.pos >= self.chars.len()
    }

    pub fn reset_buff(&mut self) {
        self.buff_start = self.pos;
    }

    pub fn current_range(&self) -> SourceRange {
        let start = self.byte_offset(self.buff_start);
        let end = self.byte_offset(self.pos);
        SourceRange::new(start, end - start)
    }

    pub fn current_text(&self) -> &'a str {
        let start = self.byte_offset(self.buff_start);
        let end = self.byte_offset(self.pos);
        &self.text[start..end]
    }

    pub fn eat_while(&mut self, predicate: impl Fn(char) -> bool) {
        while !self.is_eof() && predicate(self.current_char()) {
            self.bump();
        }
    }

    /// Consumes a run of `ch`, returning how many were eaten.
    pub fn eat_when(&mut self, ch: char) -> usize {
        let mut count = 0;
        while self.current_char() == ch {
            self.bump();
            count += 1;
        }
        count
    }

    pub fn is_start_of_line(&self) -> bool {
        if self.pos == 0 {
            return true;
        }
        matches!(
            self.chars.get(self.pos - 1).map(|(_, ch)| *ch),
            Some('\n') | Some('\r')
        )
    }
}
