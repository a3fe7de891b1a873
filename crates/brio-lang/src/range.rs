use nom_locate::LocatedSpan;

pub type Span<'a> = LocatedSpan<&'a str>;

#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy, Hash)]
pub struct Position {
    pub line: u32,
    pub column: usize,
}

impl Default for Position {
    fn default() -> Self {
        Position { line: 1, column: 1 }
    }
}

impl Position {
    pub fn new(line: u32, column: usize) -> Self {
        Position { line, column }
    }
}

#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy, Default, Hash)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub fn new(start: Position, end: Position) -> Self {
        Range { start, end }
    }

    /// The line the range starts on, which is what template errors report.
    pub fn line(&self) -> u32 {
        self.start.line
    }
}

impl<'a> From<Span<'a>> for Position {
    fn from(span: Span<'a>) -> Self {
        Position {
            line: span.location_line(),
            column: span.get_utf8_column(),
        }
    }
}

impl<'a> From<Span<'a>> for Range {
    fn from(span: Span<'a>) -> Self {
        let start: Position = span.into();
        let fragment = span.fragment();
        let newlines = fragment.matches('\n').count() as u32;
        let end = if newlines == 0 {
            Position::new(start.line, start.column + fragment.chars().count())
        } else {
            let tail = fragment.rsplit('\n').next().unwrap_or_default();
            Position::new(start.line + newlines, tail.chars().count() + 1)
        };

        Range { start, end }
    }
}
