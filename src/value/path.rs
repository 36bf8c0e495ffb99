use std::fmt::{self, Display, Write};

/// One step into a document: a field label or a list index.
///
/// Labels starting with `#` address definitions (attached fields such as the
/// `#up` compute script) rather than regular fields.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Selector {
    Field(String),
    Index(usize),
}

impl Selector {
    pub fn is_definition(&self) -> bool {
        matches!(self, Selector::Field(label) if label.starts_with('#'))
    }
}

impl From<&str> for Selector {
    fn from(label: &str) -> Self {
        Selector::Field(label.to_string())
    }
}

impl From<String> for Selector {
    fn from(label: String) -> Self {
        Selector::Field(label)
    }
}

impl From<usize> for Selector {
    fn from(index: usize) -> Self {
        Selector::Index(index)
    }
}

/// An absolute location inside a document, e.g. `build.#up[0].from`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path(Vec<Selector>);

impl Path {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Parses a dotted path. Labels that are not plain identifiers may be
    /// quoted (`mount."/src"`), list indices use brackets (`#up[2]`).
    ///
    /// Parsing never fails: malformed brackets are read as labels.
    pub fn parse(input: &str) -> Self {
        let mut selectors = Vec::new();
        let mut current = String::new();
        let mut chars = input.chars();

        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    if !current.is_empty() {
                        selectors.push(Selector::Field(std::mem::take(&mut current)));
                    }
                }
                '"' => {
                    let mut label = std::mem::take(&mut current);
                    while let Some(c) = chars.next() {
                        match c {
                            '\\' => {
                                if let Some(escaped) = chars.next() {
                                    label.push(escaped);
                                }
                            }
                            '"' => break,
                            c => label.push(c),
                        }
                    }
                    selectors.push(Selector::Field(label));
                }
                '[' => {
                    if !current.is_empty() {
                        selectors.push(Selector::Field(std::mem::take(&mut current)));
                    }
                    let mut inner = String::new();
                    for c in chars.by_ref() {
                        if c == ']' {
                            break;
                        }
                        inner.push(c);
                    }
                    match inner.trim().parse::<usize>() {
                        Ok(index) => selectors.push(Selector::Index(index)),
                        Err(_) => selectors.push(Selector::Field(inner)),
                    }
                }
                c => current.push(c),
            }
        }

        if !current.is_empty() {
            selectors.push(Selector::Field(current));
        }

        Self(selectors)
    }

    pub fn selectors(&self) -> &[Selector] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, selector: impl Into<Selector>) -> Self {
        let mut selectors = self.0.clone();
        selectors.push(selector.into());
        Self(selectors)
    }

    pub fn join(&self, other: &Path) -> Self {
        let mut selectors = self.0.clone();
        selectors.extend(other.0.iter().cloned());
        Self(selectors)
    }

    pub fn parent(&self) -> Option<Self> {
        match self.0.split_last() {
            Some((_, rest)) => Some(Self(rest.to_vec())),
            None => None,
        }
    }

    pub fn last(&self) -> Option<&Selector> {
        self.0.last()
    }

    pub fn starts_with(&self, prefix: &Path) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// True when any step of the path goes through a definition.
    pub fn in_definition(&self) -> bool {
        self.0.iter().any(Selector::is_definition)
    }
}

impl From<&str> for Path {
    fn from(value: &str) -> Self {
        Path::parse(value)
    }
}

impl From<Vec<Selector>> for Path {
    fn from(value: Vec<Selector>) -> Self {
        Self(value)
    }
}

fn is_plain_label(label: &str) -> bool {
    !label.is_empty()
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '#' | '$' | '-'))
}

pub(crate) fn fmt_label(f: &mut impl Write, label: &str) -> fmt::Result {
    if is_plain_label(label) {
        f.write_str(label)
    } else {
        f.write_char('"')?;
        for c in label.chars() {
            if matches!(c, '"' | '\\') {
                f.write_char('\\')?;
            }
            f.write_char(c)?;
        }
        f.write_char('"')
    }
}

impl Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, selector) in self.0.iter().enumerate() {
            match selector {
                Selector::Field(label) => {
                    if i > 0 {
                        f.write_char('.')?;
                    }
                    fmt_label(f, label)?;
                }
                Selector::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}
