//! TaskPaper domain library: an indentation-outline document model with
//! inline `@tag` metadata, plus the projectors built on top of it (due-date
//! timeline, logbook archival). The core is pure; all file I/O lives in the
//! binary driver.

pub mod core {
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::cmp::Ordering;
    use std::fmt;
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct DocumentId(pub Uuid);

    impl DocumentId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    /// Handle into a document's node arena.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ItemId(pub usize);

    /* ------------------------------- Tags ------------------------------- */

    /// Typed tag payload. Raw text is coerced int, then float, then kept as text.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(untagged)]
    pub enum TagValue {
        Int(i64),
        Float(f64),
        Text(String),
    }

    impl TagValue {
        pub fn coerce(raw: &str) -> Self {
            if let Ok(v) = raw.parse::<i64>() {
                return Self::Int(v);
            }
            if let Ok(v) = raw.parse::<f64>() {
                return Self::Float(v);
            }
            Self::Text(raw.to_string())
        }

        pub fn is_truthy(&self) -> bool {
            match self {
                Self::Int(v) => *v != 0,
                Self::Float(v) => *v != 0.0,
                Self::Text(s) => !s.is_empty(),
            }
        }

        fn as_number(&self) -> Option<f64> {
            match self {
                Self::Int(v) => Some(*v as f64),
                Self::Float(v) => Some(*v),
                Self::Text(_) => None,
            }
        }

        /// Total order used by the filter engine: numbers before text,
        /// numbers compared numerically, text byte-wise.
        pub fn compare(&self, other: &Self) -> Ordering {
            match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => match (self, other) {
                    (Self::Text(a), Self::Text(b)) => a.cmp(b),
                    _ => Ordering::Equal,
                },
            }
        }
    }

    impl fmt::Display for TagValue {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Int(v) => write!(f, "{v}"),
                // Integral floats keep their decimal point so values
                // round-trip as written (`@p(2.0)` stays `@p(2.0)`).
                Self::Float(v) if v.is_finite() && v.fract() == 0.0 => write!(f, "{v:.1}"),
                Self::Float(v) => write!(f, "{v}"),
                Self::Text(s) => f.write_str(s),
            }
        }
    }

    /// A single `@name` / `@name(value)` metadatum. Identity is by name;
    /// the name keeps its leading `@`.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Tag {
        pub name: String,
        pub value: Option<TagValue>,
    }

    impl Tag {
        /// Build a tag from a raw parenthesized value. Empty or
        /// whitespace-only values normalize to no value.
        pub fn new(name: impl Into<String>, raw_value: Option<&str>) -> Self {
            let value = raw_value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(TagValue::coerce);
            Self {
                name: name.into(),
                value,
            }
        }
    }

    impl fmt::Display for Tag {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match &self.value {
                Some(value) => write!(f, "{}({})", self.name, value),
                None => f.write_str(&self.name),
            }
        }
    }

    /* ------------------------------- Items ------------------------------- */

    /// Closed set of outline line kinds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum ItemKind {
        Project,
        Task,
        Comment,
    }

    impl ItemKind {
        /// Marker-stripping rule per kind, used for breadcrumbs: a Project
        /// drops its trailing `:`, a Task its leading `- `, a Comment is
        /// already bare.
        pub fn strip_markers(self, text: &str) -> &str {
            match self {
                Self::Project => {
                    let t = text.trim_end();
                    t.strip_suffix(':').unwrap_or(t)
                }
                Self::Task => {
                    let t = text.trim_start();
                    t.strip_prefix("- ").unwrap_or(t)
                }
                Self::Comment => text,
            }
        }
    }

    /// One outline line. `text` has tags stripped for Task/Project nodes;
    /// Comment lines keep their raw text and an empty tag map.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Item {
        pub kind: ItemKind,
        /// Count of leading tab characters.
        pub indent: usize,
        pub text: String,
        /// Insertion-ordered; this order is the serialization order.
        #[serde(default)]
        pub tags: IndexMap<String, Tag>,
        /// 1-based source line; `None` for synthesized nodes.
        pub line_number: Option<usize>,
        /// Blank lines that followed this node in the source.
        #[serde(default)]
        pub trailing_blank_lines: usize,
        /// Non-owning back-reference, used for ancestry walks and deletion.
        pub parent: Option<ItemId>,
        #[serde(default)]
        pub children: Vec<ItemId>,
    }

    impl Item {
        pub fn new(
            kind: ItemKind,
            indent: usize,
            text: impl Into<String>,
            line_number: Option<usize>,
        ) -> Self {
            Self {
                kind,
                indent,
                text: text.into(),
                tags: IndexMap::new(),
                line_number,
                trailing_blank_lines: 0,
                parent: None,
                children: Vec::new(),
            }
        }

        pub fn has_tag(&self, name: &str) -> bool {
            self.tags.contains_key(name)
        }

        pub fn stripped_text(&self) -> &str {
            self.kind.strip_markers(&self.text)
        }

        /// The full line as serialized: text plus tags in map order, no
        /// indentation and no newline.
        pub fn line_text(&self) -> String {
            let mut s = self.text.clone();
            if !self.tags.is_empty() {
                let rendered: Vec<String> = self.tags.values().map(Tag::to_string).collect();
                s.push(' ');
                s.push_str(&rendered.join(" "));
            }
            s
        }
    }

    /* ------------------------------ Document ------------------------------ */

    /// Aggregate root: an ordered forest of items backed by an arena.
    /// Parent→children edges own the tree shape; deletion detaches a node
    /// but leaves it addressable in the arena, which is what lets the
    /// archiver keep working with already-excised subtrees.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Document {
        pub id: DocumentId,
        nodes: Vec<Item>,
        /// Top-level items in source order.
        pub roots: Vec<ItemId>,
        /// Blank lines folded onto the document itself when its first
        /// top-level node is deleted; rendered at the very end.
        #[serde(default)]
        pub trailing_blank_lines: usize,
    }

    impl Document {
        pub fn new() -> Self {
            Self {
                id: DocumentId::new(),
                nodes: Vec::new(),
                roots: Vec::new(),
                trailing_blank_lines: 0,
            }
        }

        pub fn item(&self, id: ItemId) -> &Item {
            &self.nodes[id.0]
        }

        pub fn item_mut(&mut self, id: ItemId) -> &mut Item {
            &mut self.nodes[id.0]
        }

        pub fn alloc(&mut self, item: Item) -> ItemId {
            let id = ItemId(self.nodes.len());
            self.nodes.push(item);
            id
        }

        /// Append `id` under `parent` (or to the top level).
        pub fn attach(&mut self, id: ItemId, parent: Option<ItemId>) {
            self.item_mut(id).parent = parent;
            match parent {
                Some(pid) => self.item_mut(pid).children.push(id),
                None => self.roots.push(id),
            }
        }

        /// Pre-order snapshot of every reachable node. Mutating transforms
        /// must collect ids first and mutate afterwards; deletions reshape
        /// the tree mid-walk otherwise.
        pub fn walk(&self) -> Vec<ItemId> {
            let mut out = Vec::with_capacity(self.nodes.len());
            for &root in &self.roots {
                self.push_subtree(root, &mut out);
            }
            out
        }

        /// Pre-order snapshot of `id` and its descendants.
        pub fn walk_from(&self, id: ItemId) -> Vec<ItemId> {
            let mut out = Vec::new();
            self.push_subtree(id, &mut out);
            out
        }

        fn push_subtree(&self, id: ItemId, out: &mut Vec<ItemId>) {
            out.push(id);
            for &child in &self.item(id).children {
                self.push_subtree(child, out);
            }
        }

        /// Look up the node starting at a 1-based source line. Non-positive
        /// line numbers are a precondition violation; lines past the end of
        /// the document are simply not found.
        pub fn at_line(&self, line_number: i64) -> Result<Option<ItemId>, DomainError> {
            if line_number <= 0 {
                return Err(DomainError::LineAccessOutOfRange(line_number));
            }
            let wanted = line_number as usize;
            Ok(self
                .walk()
                .into_iter()
                .find(|&id| self.item(id).line_number == Some(wanted)))
        }

        /// Exact-text lookup over the whole document.
        pub fn find(&self, text: &str) -> Result<ItemId, DomainError> {
            self.walk()
                .into_iter()
                .find(|&id| self.item(id).text == text)
                .ok_or_else(|| DomainError::UnknownKey(text.to_string()))
        }

        /// Exact-text lookup scoped to `scope` and its subtree.
        pub fn find_in(&self, scope: ItemId, text: &str) -> Result<ItemId, DomainError> {
            self.walk_from(scope)
                .into_iter()
                .find(|&id| self.item(id).text == text)
                .ok_or_else(|| DomainError::UnknownKey(text.to_string()))
        }

        /// Detach `id` from the tree. Its trailing blank lines fold into the
        /// preceding sibling, or into the parent (the document, for a first
        /// top-level node) so blank-line accounting survives the removal.
        pub fn delete(&mut self, id: ItemId) {
            let blanks = self.item(id).trailing_blank_lines;
            let parent = self.item(id).parent;
            if let Some(pid) = parent {
                if let Some(idx) = self.item(pid).children.iter().position(|&c| c == id) {
                    let target = if idx == 0 {
                        pid
                    } else {
                        self.item(pid).children[idx - 1]
                    };
                    self.item_mut(target).trailing_blank_lines += blanks;
                    self.item_mut(pid).children.remove(idx);
                }
            } else if let Some(idx) = self.roots.iter().position(|&c| c == id) {
                if idx == 0 {
                    self.trailing_blank_lines += blanks;
                } else {
                    let prev = self.roots[idx - 1];
                    self.item_mut(prev).trailing_blank_lines += blanks;
                }
                self.roots.remove(idx);
            }
            let item = self.item_mut(id);
            item.trailing_blank_lines = 0;
            item.parent = None;
        }

        /// Deep-copy a subtree out of another document's arena, attaching
        /// the copy under `parent` here. Returns the id of the copied root.
        pub fn adopt_subtree(
            &mut self,
            src: &Document,
            src_id: ItemId,
            parent: Option<ItemId>,
        ) -> ItemId {
            let source = src.item(src_id);
            let mut copy = source.clone();
            copy.children = Vec::new();
            copy.parent = None;
            let id = self.alloc(copy);
            self.attach(id, parent);
            for &child in &source.children {
                self.adopt_subtree(src, child, Some(id));
            }
            id
        }

        /// Stable per-node tag reordering: valueless tags byte-wise sorted,
        /// then valued tags byte-wise sorted. Applying it twice is the same
        /// as applying it once.
        pub fn reorder_tags(&mut self) {
            for id in self.walk() {
                let item = self.item_mut(id);
                let mut order: Vec<String> = item
                    .tags
                    .values()
                    .filter(|t| t.value.is_none())
                    .map(|t| t.name.clone())
                    .collect();
                order.sort();
                let mut valued: Vec<String> = item
                    .tags
                    .values()
                    .filter(|t| t.value.is_some())
                    .map(|t| t.name.clone())
                    .collect();
                valued.sort();
                order.extend(valued);
                for name in order {
                    if let Some(tag) = item.tags.shift_remove(&name) {
                        item.tags.insert(name, tag);
                    }
                }
            }
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum DomainError {
        #[error("line {line_number}: cannot read {text:?} as a YYYY-MM-DD date")]
        MalformedDate { line_number: usize, text: String },
        #[error("line numbers start at 1 (got {0})")]
        LineAccessOutOfRange(i64),
        #[error("no item with text {0:?}")]
        UnknownKey(String),
        #[error("invalid filter expression: {0}")]
        FilterSyntax(String),
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::format::format_document;
        use crate::parser::parse_document;

        #[test]
        fn tag_display() {
            let t1 = Tag::new("@done", None);
            let t2 = Tag::new("@due", Some("2011-09-14"));
            assert_eq!("@done", t1.to_string());
            assert_eq!("@due(2011-09-14)", t2.to_string());
        }

        #[test]
        fn tag_value_coercion() {
            assert_eq!(Some(TagValue::Int(1)), Tag::new("@p", Some("1")).value);
            assert_eq!(Some(TagValue::Float(1.5)), Tag::new("@p", Some("1.5")).value);
            assert_eq!(
                Some(TagValue::Text("today".into())),
                Tag::new("@due", Some("today")).value
            );
            assert_eq!(None, Tag::new("@t", Some("  ")).value);
        }

        #[test]
        fn integral_float_keeps_decimal_point() {
            assert_eq!("@p(2.0)", Tag::new("@p", Some("2.0")).to_string());
        }

        #[test]
        fn reorder_tags_simple_alphabetical() {
            let mut doc = parse_document("- was the dishes @beta @House @z\n");
            doc.reorder_tags();
            assert_eq!("- was the dishes @House @beta @z\n", format_document(&doc));
        }

        #[test]
        fn reorder_tags_valued_at_end() {
            let mut doc = parse_document("- was the dishes @precision(1) @beta @House @z\n");
            doc.reorder_tags();
            assert_eq!(
                "- was the dishes @House @beta @z @precision(1)\n",
                format_document(&doc)
            );
        }

        #[test]
        fn reorder_tags_whole_document() {
            let text = "Keep things in order: @home @alp\n\
                        \t- One @due(today) @zshop @beta\n\
                        \t- Two @beta @alpha @due(tomorrow)\n";
            let wanted = "Keep things in order: @alp @home\n\
                          \t- One @beta @zshop @due(today)\n\
                          \t- Two @alpha @beta @due(tomorrow)\n";
            let mut doc = parse_document(text);
            doc.reorder_tags();
            assert_eq!(wanted, format_document(&doc));
        }

        #[test]
        fn reorder_tags_is_idempotent() {
            let mut once = parse_document("- x @precision(1) @beta @House\n");
            once.reorder_tags();
            let mut twice = parse_document("- x @precision(1) @beta @House\n");
            twice.reorder_tags();
            twice.reorder_tags();
            assert_eq!(format_document(&once), format_document(&twice));
        }

        #[test]
        fn delete_folds_blanks_into_preceding_sibling() {
            let mut doc = parse_document("House:\n\t- A\n\t- B\n\n\t- C\n");
            let b = doc.find("- B").expect("task B");
            doc.delete(b);
            assert_eq!("House:\n\t- A\n\n\t- C\n", format_document(&doc));
        }

        #[test]
        fn delete_first_child_folds_blanks_into_parent() {
            let mut doc = parse_document("House:\n\t- A\n\n\t- B\n");
            let a = doc.find("- A").expect("task A");
            doc.delete(a);
            // The parent's trailing count renders after its remaining children.
            assert_eq!("House:\n\t- B\n\n", format_document(&doc));
        }

        #[test]
        fn at_line_finds_nodes_by_source_line() {
            let text = "One Project:\n\
                        \tA comment\n\
                        \tAnother\n\
                        \t- A Task\n\
                        \n\
                        \t- Another\n\
                        \tA subproject:\n\
                        \t\t\tThis is some written text\n\
                        \t\t- And one more task\n";
            let doc = parse_document(text);
            let text_at = |n: i64| {
                let id = doc.at_line(n).expect("positive line").expect("present");
                doc.item(id).text.clone()
            };
            assert_eq!("One Project:", text_at(1));
            assert_eq!("A comment", text_at(2));
            assert_eq!("A subproject:", text_at(7));
            assert_eq!("This is some written text", text_at(8));
            assert_eq!("- And one more task", text_at(9));
        }

        #[test]
        fn at_line_rejects_non_positive_numbers() {
            let doc = parse_document("- x\n");
            assert!(matches!(
                doc.at_line(0),
                Err(DomainError::LineAccessOutOfRange(0))
            ));
            assert!(doc.at_line(-3).is_err());
        }

        #[test]
        fn at_line_past_the_end_is_not_found() {
            let doc = parse_document("- x\n");
            assert_eq!(None, doc.at_line(99).expect("positive line"));
        }

        #[test]
        fn find_is_subtree_scoped() {
            let doc = parse_document("A:\n\t- inside\nB:\n\t- elsewhere\n");
            let a = doc.find("A:").expect("project A");
            let b = doc.find("B:").expect("project B");
            assert!(doc.find_in(a, "- inside").is_ok());
            assert!(matches!(
                doc.find_in(b, "- inside"),
                Err(DomainError::UnknownKey(_))
            ));
        }
    }
}

pub mod parser {
    //! Line-oriented TaskPaper parser. The document scan is total: any line
    //! is at worst a comment, so parsing never fails. The micro-grammars
    //! (tag occurrences, dates) are nom combinators.

    use crate::core::{Document, Item, ItemId, ItemKind, Tag};
    use chrono::NaiveDate;
    use indexmap::IndexMap;
    use nom::{
        IResult,
        bytes::complete::{take_while, take_while1, take_while_m_n},
        character::complete::{char, space0},
        combinator::{map_res, opt},
        error::VerboseError,
        sequence::{delimited, tuple},
    };

    pub(crate) type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    pub(crate) fn is_word_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '_'
    }

    /* ---------------------------- Tag extraction ---------------------------- */

    /// One `@name` / `@name(value)` occurrence with its surrounding spaces.
    fn tag_occurrence(i: &str) -> PResult<'_, (&str, Option<&str>)> {
        let (i, _) = space0(i)?;
        let (i, _) = char('@')(i)?;
        let (i, name) = take_while1(is_word_char)(i)?;
        let (i, value) = opt(delimited(char('('), take_while(|c| c != ')'), char(')')))(i)?;
        let (i, _) = space0(i)?;
        Ok((i, (name, value)))
    }

    /// Pull every tag occurrence out of a line, returning the residual text
    /// and an insertion-ordered map. A repeated name overwrites the value
    /// but keeps its first-seen position.
    pub fn extract_tags(text: &str) -> (String, IndexMap<String, Tag>) {
        let mut tags: IndexMap<String, Tag> = IndexMap::new();
        let mut residual = String::with_capacity(text.len());
        let mut rest = text;
        while !rest.is_empty() {
            if let Ok((next, (name, value))) = tag_occurrence(rest) {
                let name = format!("@{name}");
                tags.insert(name.clone(), Tag::new(name, value));
                rest = next;
                continue;
            }
            match rest.chars().next() {
                Some(c) => {
                    residual.push(c);
                    rest = &rest[c.len_utf8()..];
                }
                None => break,
            }
        }
        (residual, tags)
    }

    /* ------------------------------- Dates ------------------------------- */

    /// Strict `YYYY-MM-DD`; the whole token must be consumed.
    pub(crate) fn date_from_token(token: &str) -> Option<NaiveDate> {
        match parse_date(token) {
            Ok(("", date)) => Some(date),
            _ => None,
        }
    }

    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                map_res(take_while_m_n(4, 4, char_is_digit), |s: &str| {
                    s.parse::<i32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn char_is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

    /* ---------------------------- Document scan ---------------------------- */

    /// Parse raw text into a document tree. Indentation is tab characters
    /// only; blank lines fold onto the previously constructed node (blanks
    /// before the first node are dropped).
    pub fn parse_document(text: &str) -> Document {
        let mut doc = Document::new();
        let mut prev: Option<ItemId> = None;

        for (idx, raw_line) in text.lines().enumerate() {
            if raw_line.trim().is_empty() {
                if let Some(last) = prev {
                    doc.item_mut(last).trailing_blank_lines += 1;
                }
                continue;
            }

            let indent = raw_line.chars().take_while(|&c| c == '\t').count();
            let content = &raw_line[indent..];
            let (kind, text, tags) = classify_line(content);

            // Walk the previous node's ancestor chain; the first ancestor
            // with a strictly smaller indent is the parent.
            let mut parent = prev;
            while let Some(pid) = parent {
                if doc.item(pid).indent < indent {
                    break;
                }
                parent = doc.item(pid).parent;
            }

            let mut item = Item::new(kind, indent, text, Some(idx + 1));
            item.tags = tags;
            let id = doc.alloc(item);
            doc.attach(id, parent);
            prev = Some(id);
        }

        doc
    }

    /// Kind rules, tried in order: a `-` first character makes a Task; a
    /// tag-stripped residual ending in `:` makes a Project (its content is
    /// whitespace-trimmed, the one serialization-visible normalization);
    /// anything else stays a Comment with raw text and no tags.
    fn classify_line(content: &str) -> (ItemKind, String, IndexMap<String, Tag>) {
        if content.starts_with('-') {
            let (text, tags) = extract_tags(content);
            return (ItemKind::Task, text, tags);
        }
        let (residual, _) = extract_tags(content);
        if residual.trim().ends_with(':') {
            let (text, tags) = extract_tags(content.trim());
            return (ItemKind::Project, text, tags);
        }
        (ItemKind::Comment, content.to_string(), IndexMap::new())
    }

}

pub mod format {
    //! Serializer: the inverse of parsing up to the documented
    //! normalizations (Project whitespace trim, dropped leading blanks).

    use crate::core::{Document, ItemId};

    pub fn format_document(doc: &Document) -> String {
        let mut out = String::new();
        for &root in &doc.roots {
            render_into(doc, root, &mut out);
        }
        for _ in 0..doc.trailing_blank_lines {
            out.push('\n');
        }
        out
    }

    /// Render a single node and its subtree.
    pub fn render_subtree(doc: &Document, id: ItemId) -> String {
        let mut out = String::new();
        render_into(doc, id, &mut out);
        out
    }

    fn render_into(doc: &Document, id: ItemId, out: &mut String) {
        let item = doc.item(id);
        if !item.text.is_empty() {
            for _ in 0..item.indent {
                out.push('\t');
            }
            out.push_str(&item.line_text());
            out.push('\n');
        }
        for &child in &item.children {
            render_into(doc, child, out);
        }
        for _ in 0..item.trailing_blank_lines {
            out.push('\n');
        }
    }

}

pub mod filter {
    //! Boolean tag-expression filtering. The expression grammar is tiny on
    //! purpose: `or` / `and` / `not` / parentheses / `@tag` atoms, parsed
    //! with nom and evaluated against each node's tag map. Nothing in an
    //! expression is ever executed as code.

    use crate::core::{Document, DomainError, ItemId, Tag, TagValue};
    use crate::parser::{PResult, is_word_char};
    use indexmap::IndexMap;
    use nom::{
        branch::alt,
        bytes::complete::take_while1,
        character::complete::{char, space0},
        error::{VerboseError, VerboseErrorKind},
        sequence::{delimited, preceded},
    };
    use std::cmp::Ordering;

    /* ------------------------------ Order clause ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct OrderBy {
        /// Tag name with `@` prefix.
        pub tag: String,
        pub reverse: bool,
    }

    /// Cut an `o:[+|-]tagname` clause out of the command line.
    fn split_order_clause(cmdline: &str) -> (String, Option<OrderBy>) {
        if let Some(pos) = cmdline.find("o:") {
            let after = &cmdline[pos + 2..];
            let token: String = after.chars().take_while(|c| !c.is_whitespace()).collect();
            if !token.is_empty() {
                let rest = format!("{}{}", &cmdline[..pos], &after[token.len()..]);
                let (reverse, name) = match token.strip_prefix('-') {
                    Some(n) => (true, n),
                    None => (false, token.strip_prefix('+').unwrap_or(token.as_str())),
                };
                let tag = if name.starts_with('@') {
                    name.to_string()
                } else {
                    format!("@{name}")
                };
                return (rest, Some(OrderBy { tag, reverse }));
            }
        }
        (cmdline.to_string(), None)
    }

    /* ------------------------------ Expressions ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Expr {
        Tag(String),
        Not(Box<Expr>),
        And(Box<Expr>, Box<Expr>),
        Or(Box<Expr>, Box<Expr>),
    }

    fn parse_expression(src: &str) -> Result<Expr, DomainError> {
        match or_expr(src) {
            Ok((rest, expr)) if rest.trim().is_empty() => Ok(expr),
            Ok((rest, _)) => Err(DomainError::FilterSyntax(format!(
                "unexpected trailing input {rest:?}"
            ))),
            Err(_) => Err(DomainError::FilterSyntax(src.to_string())),
        }
    }

    fn or_expr(i: &str) -> PResult<'_, Expr> {
        let (mut i, mut lhs) = and_expr(i)?;
        while let Ok((rest, ())) = keyword("or")(i) {
            let (rest, rhs) = and_expr(rest)?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
            i = rest;
        }
        Ok((i, lhs))
    }

    fn and_expr(i: &str) -> PResult<'_, Expr> {
        let (mut i, mut lhs) = not_expr(i)?;
        while let Ok((rest, ())) = keyword("and")(i) {
            let (rest, rhs) = not_expr(rest)?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
            i = rest;
        }
        Ok((i, lhs))
    }

    fn not_expr(i: &str) -> PResult<'_, Expr> {
        if let Ok((rest, ())) = keyword("not")(i) {
            let (rest, inner) = not_expr(rest)?;
            return Ok((rest, Expr::Not(Box::new(inner))));
        }
        primary(i)
    }

    fn primary(i: &str) -> PResult<'_, Expr> {
        preceded(space0, alt((parens, tag_atom)))(i)
    }

    fn parens(i: &str) -> PResult<'_, Expr> {
        delimited(char('('), or_expr, preceded(space0, char(')')))(i)
    }

    fn tag_atom(i: &str) -> PResult<'_, Expr> {
        let (i, _) = char('@')(i)?;
        let (i, name) = take_while1(is_word_char)(i)?;
        Ok((i, Expr::Tag(format!("@{name}"))))
    }

    fn keyword(kw: &'static str) -> impl Fn(&str) -> PResult<'_, ()> {
        move |i: &str| {
            let (rest, _) = space0(i)?;
            let (rest, word) = take_while1(|c: char| c.is_ascii_alphabetic())(rest)?;
            if word == kw {
                Ok((rest, ()))
            } else {
                Err(nom::Err::Error(VerboseError {
                    errors: vec![(i, VerboseErrorKind::Context("keyword"))],
                }))
            }
        }
    }

    /// Atom truth: absent tag → false; present without value → true;
    /// present with value → the value's truthiness.
    fn eval_expr(expr: &Expr, tags: &IndexMap<String, Tag>) -> bool {
        match expr {
            Expr::Tag(name) => tags
                .get(name)
                .map(|t| t.value.as_ref().map_or(true, TagValue::is_truthy))
                .unwrap_or(false),
            Expr::Not(inner) => !eval_expr(inner, tags),
            Expr::And(a, b) => eval_expr(a, tags) && eval_expr(b, tags),
            Expr::Or(a, b) => eval_expr(a, tags) || eval_expr(b, tags),
        }
    }

    /* ------------------------------- Filtering ------------------------------- */

    /// Evaluate a filter command line against the tree. Traversal is
    /// pre-order and stops at a match: a matching node's subtree is not
    /// searched further. Without an order clause the result is in source
    /// order; with one, a stable sort on the tag's value (missing values
    /// first, reversal flips the comparator so ties keep source order).
    pub fn filter_document(doc: &Document, cmdline: &str) -> Result<Vec<ItemId>, DomainError> {
        let (expr_src, order) = split_order_clause(cmdline);
        let expr_src = expr_src.trim().to_string();

        let mut matches = Vec::new();
        if !expr_src.is_empty() {
            let expr = parse_expression(&expr_src)?;
            for &root in &doc.roots {
                collect_matches(doc, root, &expr, &mut matches);
            }
        }

        match order {
            None => matches.sort_by_key(|&id| doc.item(id).line_number),
            Some(OrderBy { tag, reverse }) => {
                matches.sort_by(|&a, &b| {
                    let ka = doc.item(a).tags.get(&tag).and_then(|t| t.value.as_ref());
                    let kb = doc.item(b).tags.get(&tag).and_then(|t| t.value.as_ref());
                    let ord = match (ka, kb) {
                        (None, None) => Ordering::Equal,
                        (None, Some(_)) => Ordering::Less,
                        (Some(_), None) => Ordering::Greater,
                        (Some(x), Some(y)) => x.compare(y),
                    };
                    if reverse { ord.reverse() } else { ord }
                });
            }
        }

        Ok(matches)
    }

    fn collect_matches(doc: &Document, id: ItemId, expr: &Expr, out: &mut Vec<ItemId>) {
        if eval_expr(expr, &doc.item(id).tags) {
            out.push(id);
            return;
        }
        for &child in &doc.item(id).children {
            collect_matches(doc, child, expr, out);
        }
    }

}

pub mod projectors {
    pub mod timeline_projector {
        //! Projects open `@due` items into a date-bucketed read-only view:
        //! one synthetic Project per bucket (overdue, today, each future
        //! date), each holding copies of the matching items.

        use crate::core::{Document, DomainError, Item, ItemId, ItemKind, TagValue};
        use crate::format::render_subtree;
        use crate::parser::{date_from_token, parse_document};
        use chrono::NaiveDate;
        use indexmap::IndexMap;

        /// Fixed footer marking the rendered timeline as read-only.
        pub const READ_ONLY_FOOTER: &str = " vim:ro";

        /// Bucket sort key. Variant order is the output order: overdue
        /// first, today second, future dates ascending.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        enum BucketKey {
            Overdue,
            Today,
            Upcoming(NaiveDate),
        }

        /// Build the timeline tree for `doc` as of `today`. Items carrying
        /// `@done` are excluded regardless of due date.
        pub fn build_timeline(doc: &Document, today: NaiveDate) -> Result<Document, DomainError> {
            let mut timeline = Document::new();
            let mut buckets: IndexMap<BucketKey, ItemId> = IndexMap::new();

            for id in doc.walk() {
                let item = doc.item(id);
                if !item.has_tag("@due") || item.has_tag("@done") {
                    continue;
                }
                let due = due_date(item)?;
                let key = if due < today {
                    BucketKey::Overdue
                } else if due == today {
                    BucketKey::Today
                } else {
                    BucketKey::Upcoming(due)
                };
                let bucket = *buckets.entry(key).or_insert_with(|| {
                    let project = Item::new(ItemKind::Project, 0, bucket_label(key, today), None);
                    let pid = timeline.alloc(project);
                    timeline.attach(pid, None);
                    pid
                });
                let copy = timeline.adopt_subtree(doc, id, Some(bucket));
                let top = timeline.item_mut(copy);
                top.indent = 1;
                top.trailing_blank_lines = 0;
            }

            let mut ordered: Vec<(BucketKey, ItemId)> = buckets.into_iter().collect();
            ordered.sort_by(|a, b| a.0.cmp(&b.0));
            timeline.roots = ordered.into_iter().map(|(_, id)| id).collect();
            Ok(timeline)
        }

        /// Render a timeline tree: buckets separated by one blank line,
        /// then two blank lines and the read-only footer.
        pub fn render_timeline(timeline: &Document) -> String {
            let parts: Vec<String> = timeline
                .roots
                .iter()
                .map(|&id| render_subtree(timeline, id))
                .collect();
            format!("{}\n\n{}\n", parts.join("\n"), READ_ONLY_FOOTER)
        }

        /// Text-level driver: document text in, timeline text out.
        pub fn produce_timeline(text: &str, today: NaiveDate) -> Result<String, DomainError> {
            let doc = parse_document(text);
            Ok(render_timeline(&build_timeline(&doc, today)?))
        }

        fn bucket_label(key: BucketKey, today: NaiveDate) -> String {
            match key {
                BucketKey::Overdue => "Overdue:".to_string(),
                BucketKey::Today => "Today:".to_string(),
                BucketKey::Upcoming(date) => {
                    let diff = (date - today).num_days();
                    let unit = if diff == 1 { "day" } else { "days" };
                    format!("{} (+{} {}):", date.format("%A, %d. %B %Y"), diff, unit)
                }
            }
        }

        fn due_date(item: &Item) -> Result<NaiveDate, DomainError> {
            let malformed = || DomainError::MalformedDate {
                line_number: item.line_number.unwrap_or(0),
                text: item.text.clone(),
            };
            let value = item
                .tags
                .get("@due")
                .and_then(|t| t.value.as_ref())
                .ok_or_else(malformed)?;
            let TagValue::Text(raw) = value else {
                return Err(malformed());
            };
            // Only the first whitespace-delimited token is the date.
            let token = raw.split_whitespace().next().ok_or_else(malformed)?;
            date_from_token(token).ok_or_else(malformed)
        }

        #[cfg(test)]
        mod tests {
            use super::*;

            fn april_first() -> NaiveDate {
                NaiveDate::from_ymd_opt(2011, 4, 1).expect("valid date")
            }

            fn timeline_for(text: &str) -> String {
                produce_timeline(text, april_first()).expect("timeline")
            }

            #[test]
            fn no_due_items_yields_only_the_footer() {
                assert_eq!(
                    "\n\n vim:ro\n",
                    timeline_for("- This one has no due date @home")
                );
            }

            #[test]
            fn buckets_overdue_today_and_future_dates() {
                let text = "My cool Project:\n\
                            \t- This was due @due(2011-03-20)\n\
                            \t- This is due tomorrow @due(2011-04-02)\n\
                            \n\
                            My other cool Project:\n\
                            \t- This is due today @due(2011-04-01)\n\
                            \t- This is due in one month @due(2011-05-01)\n\
                            \n\
                            My third cool project:\n\
                            \t- Nothing here\n";
                let wanted = "Overdue:\n\
                              \t- This was due @due(2011-03-20)\n\
                              \n\
                              Today:\n\
                              \t- This is due today @due(2011-04-01)\n\
                              \n\
                              Saturday, 02. April 2011 (+1 day):\n\
                              \t- This is due tomorrow @due(2011-04-02)\n\
                              \n\
                              Sunday, 01. May 2011 (+30 days):\n\
                              \t- This is due in one month @due(2011-05-01)\n\
                              \n\
                              \n\
                              \x20vim:ro\n";
                assert_eq!(wanted, timeline_for(text));
            }

            #[test]
            fn done_items_are_excluded() {
                let text = "My cool Project:\n\
                            \t- This was due @due(2011-03-20)\n\
                            \t- This is due tomorrow @due(2011-04-02) @done\n\
                            \n\
                            My other cool Project:\n\
                            \t- This is due today @due(2011-04-01) @done\n\
                            \t- This is due in one month @due(2011-05-01)\n\
                            \n\
                            \n\
                            My third cool project:\n\
                            \t- Nothing here\n";
                let wanted = "Overdue:\n\
                              \t- This was due @due(2011-03-20)\n\
                              \n\
                              Sunday, 01. May 2011 (+30 days):\n\
                              \t- This is due in one month @due(2011-05-01)\n\
                              \n\
                              \n\
                              \x20vim:ro\n";
                assert_eq!(wanted, timeline_for(text));
            }

            #[test]
            fn copies_are_indented_exactly_once() {
                let text = "My cool Project:\n\
                            \t- This was due @due(2011-03-20)\n\
                            \tMy subproject:\n\
                            \t\t- This is due today @due(2011-04-01)\n";
                let wanted = "Overdue:\n\
                              \t- This was due @due(2011-03-20)\n\
                              \n\
                              Today:\n\
                              \t- This is due today @due(2011-04-01)\n\
                              \n\
                              \n\
                              \x20vim:ro\n";
                assert_eq!(wanted, timeline_for(text));
            }

            #[test]
            fn malformed_due_date_reports_the_line() {
                let err = produce_timeline("- Task @due(someday)\n", april_first())
                    .expect_err("must fail");
                match err {
                    DomainError::MalformedDate { line_number, text } => {
                        assert_eq!(1, line_number);
                        assert_eq!("- Task", text);
                    }
                    other => panic!("expected MalformedDate, got {other:?}"),
                }
            }
        }
    }

    pub mod logbook_projector {
        //! Archives completed items: every Task or Project carrying `@done`
        //! is excised from the active tree, rewritten with an ancestry
        //! breadcrumb, and re-filed chronologically into a logbook tree of
        //! per-date projects (most recent first). The transform is pure;
        //! both inputs are cloned.

        use crate::core::{Document, DomainError, Item, ItemId, ItemKind, TagValue};
        use crate::format::{format_document, render_subtree};
        use crate::parser::{date_from_token, parse_document};
        use chrono::NaiveDate;
        use std::collections::BTreeMap;

        const BREADCRUMB_SEPARATOR: &str = " \u{2022} ";
        const DATE_PROJECT_FORMAT: &str = "%A, %d. %B %Y:";

        pub fn archive_done(
            active: &Document,
            logbook: &Document,
            today: NaiveDate,
        ) -> Result<(Document, Document), DomainError> {
            let mut active = active.clone();
            let mut logbook = logbook.clone();

            // Phase one: collect. Deletions reshape the tree, so the ids to
            // mutate are snapshotted before anything moves.
            let done: Vec<ItemId> = active
                .walk()
                .into_iter()
                .filter(|&id| {
                    let item = active.item(id);
                    matches!(item.kind, ItemKind::Task | ItemKind::Project)
                        && item.has_tag("@done")
                })
                .collect();

            // Phase two: rewrite, re-indent and detach each collected item.
            let mut by_date: BTreeMap<NaiveDate, Vec<ItemId>> = BTreeMap::new();
            for id in done {
                let date = done_date(active.item(id), today)?;
                rewrite_as_breadcrumb(&mut active, id);
                let delta = 1 - active.item(id).indent as i64;
                for sub in active.walk_from(id) {
                    let item = active.item_mut(sub);
                    item.indent = (item.indent as i64 + delta).max(0) as usize;
                }
                active.delete(id);
                by_date.entry(date).or_default().push(id);
            }

            // Phase three: file under per-date projects, newest date first;
            // unseen dates get a fresh project at the front of the logbook.
            for (&date, ids) in by_date.iter().rev() {
                let label = date.format(DATE_PROJECT_FORMAT).to_string();
                let project = match logbook.find(&label) {
                    Ok(found) => found,
                    Err(_) => {
                        let pid = logbook.alloc(Item::new(ItemKind::Project, 0, label, None));
                        logbook.roots.insert(0, pid);
                        pid
                    }
                };
                for &id in ids {
                    logbook.adopt_subtree(&active, id, Some(project));
                }
            }

            sort_roots_by_label_date(&mut logbook)?;
            for id in logbook.walk() {
                logbook.item_mut(id).trailing_blank_lines = 0;
            }
            logbook.trailing_blank_lines = 0;

            // Serialize with one blank line between date projects and
            // reparse, so sibling spacing is rebuilt from the text itself.
            let logbook = parse_document(&render_logbook_text(&logbook));
            Ok((active, logbook))
        }

        /// Text-level driver: (document text, logbook text) in, the
        /// rewritten pair out.
        pub fn archive_done_text(
            document_text: &str,
            logbook_text: &str,
            today: NaiveDate,
        ) -> Result<(String, String), DomainError> {
            let active = parse_document(document_text);
            let logbook = parse_document(logbook_text);
            let (new_active, new_logbook) = archive_done(&active, &logbook, today)?;
            Ok((format_document(&new_active), format_document(&new_logbook)))
        }

        fn done_date(item: &Item, today: NaiveDate) -> Result<NaiveDate, DomainError> {
            match item.tags.get("@done").and_then(|t| t.value.as_ref()) {
                None => Ok(today),
                Some(TagValue::Text(raw)) => {
                    date_from_token(raw.trim()).ok_or_else(|| malformed(item))
                }
                Some(_) => Err(malformed(item)),
            }
        }

        fn malformed(item: &Item) -> DomainError {
            DomainError::MalformedDate {
                line_number: item.line_number.unwrap_or(0),
                text: item.text.clone(),
            }
        }

        /// Replace the item's text with its ancestry trail: Task and
        /// Project ancestors, outermost first, marker-stripped and joined
        /// with a bullet; the item's own marker is re-applied afterwards.
        fn rewrite_as_breadcrumb(doc: &mut Document, id: ItemId) {
            let mut parts: Vec<String> = Vec::new();
            let mut cursor = doc.item(id).parent;
            while let Some(pid) = cursor {
                let ancestor = doc.item(pid);
                if !matches!(ancestor.kind, ItemKind::Task | ItemKind::Project) {
                    break;
                }
                parts.push(ancestor.stripped_text().to_string());
                cursor = ancestor.parent;
            }
            parts.reverse();
            parts.push(doc.item(id).stripped_text().to_string());
            let joined = parts.join(BREADCRUMB_SEPARATOR);

            let item = doc.item_mut(id);
            item.text = match item.kind {
                ItemKind::Task => format!("- {joined}"),
                _ => format!("{joined}:"),
            };
        }

        fn sort_roots_by_label_date(logbook: &mut Document) -> Result<(), DomainError> {
            let mut keyed: Vec<(NaiveDate, ItemId)> = Vec::with_capacity(logbook.roots.len());
            for &id in &logbook.roots {
                let item = logbook.item(id);
                let date = NaiveDate::parse_from_str(&item.text, DATE_PROJECT_FORMAT)
                    .map_err(|_| malformed(item))?;
                keyed.push((date, id));
            }
            keyed.sort_by(|a, b| b.0.cmp(&a.0));
            logbook.roots = keyed.into_iter().map(|(_, id)| id).collect();
            Ok(())
        }

        fn render_logbook_text(logbook: &Document) -> String {
            let parts: Vec<String> = logbook
                .roots
                .iter()
                .map(|&id| render_subtree(logbook, id))
                .collect();
            parts.join("\n")
        }

        #[cfg(test)]
        mod tests {
            use super::*;

            fn day(y: i32, m: u32, d: u32) -> NaiveDate {
                NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
            }

            #[test]
            fn files_untagged_done_under_today_with_breadcrumb() {
                let (active, logbook) = archive_done_text(
                    "House:\n\t- Wash dishes @done\n\t- Mow lawn\n",
                    "",
                    day(2011, 10, 8),
                )
                .expect("archive");
                assert_eq!("House:\n\t- Mow lawn\n", active);
                assert_eq!(
                    "Saturday, 08. October 2011:\n\t- House \u{2022} Wash dishes @done\n",
                    logbook
                );
            }

            #[test]
            fn deletion_folds_blank_lines_into_the_preceding_sibling() {
                let (active, _) = archive_done_text(
                    "House:\n\t- A\n\t- B @done\n\n\t- C\n",
                    "",
                    day(2011, 10, 8),
                )
                .expect("archive");
                assert_eq!("House:\n\t- A\n\n\t- C\n", active);
            }

            #[test]
            fn explicit_done_date_picks_the_archive_project() {
                let (active, logbook) =
                    archive_done_text("- Pay bill @done(2011-09-13)\n", "", day(2011, 10, 8))
                        .expect("archive");
                assert_eq!("", active);
                assert_eq!(
                    "Tuesday, 13. September 2011:\n\t- Pay bill @done(2011-09-13)\n",
                    logbook
                );
            }

            #[test]
            fn reuses_existing_date_projects_and_sorts_descending() {
                let existing = "Tuesday, 13. September 2011:\n\t- Old entry @done(2011-09-13)\n";
                let active = "- New thing @done(2011-09-14)\n- Same day @done(2011-09-13)\n";
                let (new_active, logbook) =
                    archive_done_text(active, existing, day(2011, 10, 8)).expect("archive");
                assert_eq!("", new_active);
                assert_eq!(
                    "Wednesday, 14. September 2011:\n\
                     \t- New thing @done(2011-09-14)\n\
                     \n\
                     Tuesday, 13. September 2011:\n\
                     \t- Old entry @done(2011-09-13)\n\
                     \t- Same day @done(2011-09-13)\n",
                    logbook
                );
            }

            #[test]
            fn archive_keeps_project_header_flush() {
                // A completed sub-project keeps its children, and the item
                // archived after it follows without a separating blank line.
                let active = "Area:\n\
                              \tSub: @done\n\
                              \t\t- Child one\n\
                              \t- Loose end @done\n";
                let (new_active, logbook) =
                    archive_done_text(active, "", day(2011, 10, 8)).expect("archive");
                assert_eq!("Area:\n", new_active);
                assert_eq!(
                    "Saturday, 08. October 2011:\n\
                     \tArea \u{2022} Sub: @done\n\
                     \t\t- Child one\n\
                     \t- Area \u{2022} Loose end @done\n",
                    logbook
                );
            }

            #[test]
            fn nested_done_items_see_the_rewritten_ancestor() {
                let active = "Top: @done(2011-09-13)\n\t- Inner @done(2011-09-14)\n";
                let (new_active, logbook) =
                    archive_done_text(active, "", day(2011, 10, 8)).expect("archive");
                assert_eq!("", new_active);
                assert_eq!(
                    "Wednesday, 14. September 2011:\n\
                     \t- Top \u{2022} Inner @done(2011-09-14)\n\
                     \n\
                     Tuesday, 13. September 2011:\n\
                     \tTop: @done(2011-09-13)\n",
                    logbook
                );
            }

            #[test]
            fn malformed_done_date_reports_the_line() {
                let err = archive_done_text("- Oops @done(notadate)\n", "", day(2011, 10, 8))
                    .expect_err("must fail");
                match err {
                    DomainError::MalformedDate { line_number, text } => {
                        assert_eq!(1, line_number);
                        assert_eq!("- Oops", text);
                    }
                    other => panic!("expected MalformedDate, got {other:?}"),
                }
            }

            #[test]
            fn archive_does_not_mutate_its_inputs() {
                let active = parse_document("- Done deal @done(2011-09-13)\n");
                let logbook = parse_document("");
                let before = format_document(&active);
                let _ = archive_done(&active, &logbook, day(2011, 10, 8)).expect("archive");
                assert_eq!(before, format_document(&active));
            }
        }
    }
}

pub use format::format_document;
pub use parser::{extract_tags, parse_document};
