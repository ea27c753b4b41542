//! Incremental parser for control tags embedded in streamed text, such as
//! `<say emotion="happy">Hello</say>` or `<stop/>`.
//!
//! Input arrives in arbitrary chunks. The parser keeps only the unconsumed
//! remainder and fires callbacks as soon as each piece is unambiguous:
//! opening tags once their `>` arrives, content as it streams in, closing
//! tags once complete. Text outside registered tags is discarded.

use std::collections::HashMap;

use tracing::trace;

pub type Attributes = HashMap<String, String>;

type StartFn = Box<dyn FnMut(&Attributes) + Send>;
type MiddleFn = Box<dyn FnMut(&str) + Send>;
type EndFn = Box<dyn FnMut() + Send>;

#[derive(Default)]
pub struct TagCallbacks {
    on_start: Option<StartFn>,
    on_middle: Option<MiddleFn>,
    on_end: Option<EndFn>,
}

impl TagCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(mut self, f: impl FnMut(&Attributes) + Send + 'static) -> Self {
        self.on_start = Some(Box::new(f));
        self
    }

    pub fn on_middle(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_middle = Some(Box::new(f));
        self
    }

    pub fn on_end(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_end = Some(Box::new(f));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Outside,
    Inside { close_tag: String, name: String },
}

#[derive(Debug, PartialEq, Eq)]
enum Scan {
    /// Index of the `>` ending the tag that starts the buffer.
    Complete(usize),
    Incomplete,
    /// The leading `<` does not start a tag.
    NotATag,
}

#[derive(Debug, PartialEq, Eq)]
enum Tag {
    Open {
        name: String,
        attrs: Attributes,
        self_closing: bool,
    },
    Close,
}

pub struct TagParser {
    tags: HashMap<String, TagCallbacks>,
    buf: String,
    state: State,
}

impl Default for TagParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TagParser {
    pub fn new() -> Self {
        Self {
            tags: HashMap::new(),
            buf: String::new(),
            state: State::Outside,
        }
    }

    pub fn register(&mut self, name: impl Into<String>, callbacks: TagCallbacks) {
        self.tags.insert(name.into(), callbacks);
    }

    /// Drops buffered input and leaves any open tag without firing its end.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.state = State::Outside;
    }

    /// True while inside a registered tag.
    pub fn in_tag(&self) -> bool {
        matches!(self.state, State::Inside { .. })
    }

    pub fn feed(&mut self, chunk: &str) {
        self.buf.push_str(chunk);
        while self.step() {}
    }

    /// Consumes one piece of the buffer; false when more input is needed.
    fn step(&mut self) -> bool {
        match self.state.clone() {
            State::Outside => self.step_outside(),
            State::Inside { close_tag, name } => self.step_inside(&close_tag, &name),
        }
    }

    fn step_outside(&mut self) -> bool {
        let Some(lt) = self.buf.find('<') else {
            self.buf.clear();
            return false;
        };
        self.buf.drain(..lt);

        let end = match scan_tag(&self.buf) {
            Scan::Incomplete => return false,
            Scan::NotATag => {
                self.buf.drain(..1);
                return true;
            }
            Scan::Complete(end) => end,
        };

        let tag = parse_tag(&self.buf[1..end]);
        match tag {
            None | Some(Tag::Close) => {
                self.buf.drain(..=end);
            }
            Some(Tag::Open {
                name,
                attrs,
                self_closing,
            }) => {
                if self.tags.contains_key(&name) {
                    self.buf.drain(..=end);
                    self.fire_start(&name, &attrs);
                    if self_closing {
                        self.fire_end(&name);
                    } else {
                        self.state = State::Inside {
                            close_tag: format!("</{name}>"),
                            name,
                        };
                    }
                } else if self_closing {
                    trace!(tag = %name, "skipping unregistered tag");
                    self.buf.drain(..=end);
                } else {
                    let close_tag = format!("</{name}>");
                    let Some(pos) = self.buf[end + 1..].find(&close_tag) else {
                        return false;
                    };
                    trace!(tag = %name, "skipping unregistered tag");
                    self.buf.drain(..end + 1 + pos + close_tag.len());
                }
            }
        }
        true
    }

    fn step_inside(&mut self, close_tag: &str, name: &str) -> bool {
        if let Some(pos) = self.buf.find(close_tag) {
            let text: String = self.buf.drain(..pos).collect();
            self.buf.drain(..close_tag.len());
            self.fire_middle(name, &text);
            self.fire_end(name);
            self.state = State::Outside;
            return true;
        }

        let hold = partial_suffix_len(&self.buf, close_tag);
        let emit = self.buf.len() - hold;
        if emit > 0 {
            let text: String = self.buf.drain(..emit).collect();
            self.fire_middle(name, &text);
        }
        false
    }

    fn fire_start(&mut self, name: &str, attrs: &Attributes) {
        if let Some(f) = self.tags.get_mut(name).and_then(|cb| cb.on_start.as_mut()) {
            f(attrs);
        }
    }

    fn fire_middle(&mut self, name: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(f) = self.tags.get_mut(name).and_then(|cb| cb.on_middle.as_mut()) {
            f(text);
        }
    }

    fn fire_end(&mut self, name: &str) {
        if let Some(f) = self.tags.get_mut(name).and_then(|cb| cb.on_end.as_mut()) {
            f();
        }
    }
}

/// Length of the longest proper prefix of `close_tag` that `buf` ends with.
fn partial_suffix_len(buf: &str, close_tag: &str) -> usize {
    (1..close_tag.len())
        .rev()
        .filter(|&k| close_tag.is_char_boundary(k))
        .find(|&k| buf.ends_with(&close_tag[..k]))
        .unwrap_or(0)
}

/// Where [`scan_tag`] is inside the attribute section of a tag.
#[derive(Clone, Copy)]
enum AttrScan {
    Between,
    Key,
    AfterKey,
    AfterEq,
    Quoted(char),
    Bare,
    Slash,
}

/// Looks for the end of the tag starting at `buf[0] == '<'`.
///
/// Quotes only open a value directly after `key=`; anything that does not
/// fit `<name key="value" ...>`, `<name/>` or `</name>` is not a tag.
fn scan_tag(buf: &str) -> Scan {
    let mut chars = buf.char_indices().skip(1).peekable();

    let closing = matches!(chars.peek(), Some((_, '/')));
    if closing {
        chars.next();
    }
    match chars.next() {
        None => return Scan::Incomplete,
        Some((_, c)) if c.is_alphabetic() || c == '_' => {}
        Some(_) => return Scan::NotATag,
    }
    while chars.next_if(|&(_, c)| is_name_char(c)).is_some() {}

    let mut state = AttrScan::Between;
    for (i, c) in chars {
        state = match (state, c) {
            (AttrScan::Quoted(q), c) if c == q => AttrScan::Between,
            (AttrScan::Quoted(q), _) => AttrScan::Quoted(q),
            (AttrScan::Slash, '>') => return Scan::Complete(i),
            (AttrScan::Slash, _) => return Scan::NotATag,
            (AttrScan::AfterEq, c) if c.is_whitespace() => AttrScan::AfterEq,
            (AttrScan::AfterEq, '"' | '\'') => AttrScan::Quoted(c),
            (AttrScan::AfterEq, c) if is_name_char(c) => AttrScan::Bare,
            (AttrScan::AfterEq, _) => return Scan::NotATag,
            (_, '>') => return Scan::Complete(i),
            (_, c) if closing && !c.is_whitespace() => return Scan::NotATag,
            (_, '/') if !matches!(state, AttrScan::Bare) => AttrScan::Slash,
            (AttrScan::Bare, c) if c.is_whitespace() => AttrScan::Between,
            (AttrScan::Bare, c) if is_bare_value_char(c) => AttrScan::Bare,
            (_, c) if c.is_whitespace() => match state {
                AttrScan::Key => AttrScan::AfterKey,
                other => other,
            },
            (AttrScan::Key | AttrScan::AfterKey, '=') => AttrScan::AfterEq,
            (AttrScan::Key, c) if is_name_char(c) => AttrScan::Key,
            (AttrScan::Between | AttrScan::AfterKey, c) if is_name_char(c) => AttrScan::Key,
            _ => return Scan::NotATag,
        };
    }
    Scan::Incomplete
}

fn is_bare_value_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '<' | '>' | '"' | '\'' | '=')
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '-' | '_' | ':' | '.')
}

/// Parses the text between `<` and `>`. `None` means it is not a tag.
fn parse_tag(inner: &str) -> Option<Tag> {
    if let Some(rest) = inner.strip_prefix('/') {
        let name = rest.trim();
        return (!name.is_empty() && name.chars().all(is_name_char)).then_some(Tag::Close);
    }

    let (body, self_closing) = match inner.trim_end().strip_suffix('/') {
        Some(body) => (body, true),
        None => (inner, false),
    };
    let name_len = body.find(|c: char| !is_name_char(c)).unwrap_or(body.len());
    let name = &body[..name_len];
    if name.is_empty() || !name.starts_with(|c: char| c.is_alphabetic() || c == '_') {
        return None;
    }
    Some(Tag::Open {
        name: name.to_string(),
        attrs: parse_attributes(&body[name_len..]),
        self_closing,
    })
}

/// `key="value"` or `key='value'` pairs; a bare key maps to an empty value.
fn parse_attributes(mut s: &str) -> Attributes {
    let mut attrs = Attributes::new();
    loop {
        s = s.trim_start();
        if s.is_empty() {
            return attrs;
        }
        let key_len = s.find(|c: char| !is_name_char(c)).unwrap_or(s.len());
        if key_len == 0 {
            // Skip a stray character and keep going.
            let skip = s.chars().next().map_or(1, char::len_utf8);
            s = &s[skip..];
            continue;
        }
        let key = s[..key_len].to_string();
        s = s[key_len..].trim_start();

        let Some(rest) = s.strip_prefix('=') else {
            attrs.insert(key, String::new());
            continue;
        };
        s = rest.trim_start();

        let value = match s.chars().next() {
            Some(q @ ('"' | '\'')) => {
                let body = &s[1..];
                let end = body.find(q).unwrap_or(body.len());
                let value = body[..end].to_string();
                s = body.get(end + 1..).unwrap_or("");
                value
            }
            _ => {
                let end = s.find(char::is_whitespace).unwrap_or(s.len());
                let value = s[..end].to_string();
                s = &s[end..];
                value
            }
        };
        attrs.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    enum Ev {
        Start(String, Vec<(String, String)>),
        Middle(String, String),
        End(String),
    }

    fn recording(parser: &mut TagParser, name: &str) -> Arc<Mutex<Vec<Ev>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let (e1, e2, e3) = (events.clone(), events.clone(), events.clone());
        let (n1, n2, n3) = (name.to_string(), name.to_string(), name.to_string());
        parser.register(
            name,
            TagCallbacks::new()
                .on_start(move |attrs| {
                    let mut attrs: Vec<_> =
                        attrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                    attrs.sort();
                    e1.lock().unwrap().push(Ev::Start(n1.clone(), attrs));
                })
                .on_middle(move |text| {
                    e2.lock()
                        .unwrap()
                        .push(Ev::Middle(n2.clone(), text.to_string()))
                })
                .on_end(move || e3.lock().unwrap().push(Ev::End(n3.clone()))),
        );
        events
    }

    fn attrs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn middle_text(events: &[Ev]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                Ev::Middle(_, t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn tag_split_across_feeds() {
        let mut parser = TagParser::new();
        let events = recording(&mut parser, "say");

        parser.feed("<say a=\"1\"");
        assert!(events.lock().unwrap().is_empty());
        parser.feed(" b=\"2\">hel");
        parser.feed("lo</say>");

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                Ev::Start("say".into(), attrs(&[("a", "1"), ("b", "2")])),
                Ev::Middle("say".into(), "hel".into()),
                Ev::Middle("say".into(), "lo".into()),
                Ev::End("say".into()),
            ]
        );
    }

    #[test]
    fn unregistered_tag_is_skipped() {
        let mut parser = TagParser::new();
        let events = recording(&mut parser, "say");

        parser.feed("<foo>ignored</foo><say>ok</say>");
        assert_eq!(middle_text(&events.lock().unwrap()), "ok");
    }

    #[test]
    fn unregistered_tag_waits_for_its_close() {
        let mut parser = TagParser::new();
        let events = recording(&mut parser, "say");

        parser.feed("<foo attr=\"x\">bar <say>no</say>");
        assert!(events.lock().unwrap().is_empty());
        parser.feed("</foo><say>ok</say>");

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                Ev::Start("say".into(), vec![]),
                Ev::Middle("say".into(), "ok".into()),
                Ev::End("say".into()),
            ]
        );
    }

    #[test]
    fn chinese_text_streams_through() {
        let mut parser = TagParser::new();
        let events = recording(&mut parser, "say");

        parser.feed("<say emotion=\"happy\">你好，");
        parser.feed("世界！");
        parser.feed("</say>");

        let events = events.lock().unwrap();
        assert_eq!(events[0], Ev::Start("say".into(), attrs(&[("emotion", "happy")])));
        assert_eq!(middle_text(&events), "你好，世界！");
        assert_eq!(events.last(), Some(&Ev::End("say".into())));
    }

    #[test]
    fn partial_close_tag_is_held_back() {
        let mut parser = TagParser::new();
        let events = recording(&mut parser, "say");

        parser.feed("<say>hello</sa");
        assert_eq!(middle_text(&events.lock().unwrap()), "hello");
        parser.feed("y>");
        assert_eq!(events.lock().unwrap().last(), Some(&Ev::End("say".into())));
        assert_eq!(middle_text(&events.lock().unwrap()), "hello");
    }

    #[test]
    fn lookalike_close_is_content() {
        let mut parser = TagParser::new();
        let events = recording(&mut parser, "say");

        parser.feed("<say>a</s");
        parser.feed("ection> b</say>");
        assert_eq!(middle_text(&events.lock().unwrap()), "a</section> b");
    }

    #[test]
    fn self_closing_tags() {
        let mut parser = TagParser::new();
        let stops = recording(&mut parser, "stop");
        let says = recording(&mut parser, "say");

        parser.feed("<stop reason='done'/><ignored/><say/>");
        assert_eq!(
            *stops.lock().unwrap(),
            vec![
                Ev::Start("stop".into(), attrs(&[("reason", "done")])),
                Ev::End("stop".into()),
            ]
        );
        assert_eq!(
            *says.lock().unwrap(),
            vec![Ev::Start("say".into(), vec![]), Ev::End("say".into())]
        );
    }

    #[test]
    fn text_outside_tags_is_ignored() {
        let mut parser = TagParser::new();
        let events = recording(&mut parser, "say");

        parser.feed("thinking... 3 < 4 and 5 > 2 <say>yes</say> trailing");
        assert_eq!(middle_text(&events.lock().unwrap()), "yes");
        assert!(!parser.in_tag());
    }

    #[test]
    fn apostrophe_after_lt_in_prose() {
        let mut parser = TagParser::new();
        let events = recording(&mut parser, "say");

        parser.feed("if a <b then don't panic. ");
        parser.feed("<say>hi</say>");
        parser.feed(" more <say>again</say>");

        let events = events.lock().unwrap();
        assert_eq!(middle_text(&events), "hiagain");
        assert_eq!(events.last(), Some(&Ev::End("say".into())));
    }

    #[test]
    fn malformed_markup_is_not_a_tag() {
        for input in [
            "<b's> ",
            "<a \"quoted\"> ",
            "</a b> ",
            "<a/ > ",
            "<a = 1> ",
        ] {
            assert_eq!(scan_tag(input), Scan::NotATag, "{input}");
        }
        assert_eq!(scan_tag("<a x='it''s'>"), Scan::NotATag);
        assert_eq!(scan_tag("<say emotion=\"it's fine\">"), Scan::Complete(24));
        assert_eq!(scan_tag("<say emotion="), Scan::Incomplete);
        assert_eq!(scan_tag("<a x=bare/>"), Scan::Complete(10));
    }

    #[test]
    fn nested_tags_are_content() {
        let mut parser = TagParser::new();
        let events = recording(&mut parser, "say");

        parser.feed("<say>a<say>b</say>c</say>");
        let events = events.lock().unwrap();
        assert_eq!(middle_text(&events), "a<say>b");
        assert_eq!(
            events.iter().filter(|e| matches!(e, Ev::End(_))).count(),
            1
        );
    }

    #[test]
    fn quoted_gt_inside_attribute() {
        let mut parser = TagParser::new();
        let events = recording(&mut parser, "say");

        parser.feed("<say context=\"a > b\">x</say>");
        assert_eq!(
            events.lock().unwrap()[0],
            Ev::Start("say".into(), attrs(&[("context", "a > b")]))
        );
    }

    #[test]
    fn reset_forgets_open_tag() {
        let mut parser = TagParser::new();
        let events = recording(&mut parser, "say");

        parser.feed("<say>half");
        assert!(parser.in_tag());
        parser.reset();
        parser.feed("more</say>");
        assert!(!parser.in_tag());
        assert_eq!(middle_text(&events.lock().unwrap()), "half");
    }

    #[test]
    fn chunking_does_not_change_the_result() {
        let input = "pre <say emotion=\"sad\">one two</say> mid <x>skip</x><say>三</say><stop/>";
        let reference = {
            let mut parser = TagParser::new();
            let events = recording(&mut parser, "say");
            parser.feed(input);
            let events = events.lock().unwrap().clone();
            events
        };

        let chars: Vec<char> = input.chars().collect();
        for size in 1..8 {
            let mut parser = TagParser::new();
            let events = recording(&mut parser, "say");
            for piece in chars.chunks(size) {
                parser.feed(&piece.iter().collect::<String>());
            }
            let events = events.lock().unwrap();
            let is_start = |e: &&Ev| matches!(e, Ev::Start(..));
            let starts: Vec<_> = events.iter().filter(is_start).collect();
            let ref_starts: Vec<_> = reference.iter().filter(is_start).collect();
            assert_eq!(starts, ref_starts, "chunk size {size}");
            assert_eq!(middle_text(&events), middle_text(&reference), "chunk size {size}");
            assert_eq!(middle_text(&events), "one two三");
        }
    }

    #[test]
    fn attribute_parsing() {
        let parsed = parse_attributes(r#" a="1" b='two words' flag c=bare "#);
        assert_eq!(parsed["a"], "1");
        assert_eq!(parsed["b"], "two words");
        assert_eq!(parsed["flag"], "");
        assert_eq!(parsed["c"], "bare");
    }
}
