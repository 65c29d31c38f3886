//! The per-request script sandbox.
//!
//! Each request executes its template fragments inside a fresh Tcl
//! interpreter. The interpreter's stock `puts` and `exit` are replaced by
//! host commands, so fragments cannot reach the process's stdio or
//! terminate it; everything a template may do to the outside world goes
//! through the response buffer.
//!
//! Exposed commands: `puts` (aliased as `@`), `header`, `flush`, `die`,
//! `exit`, `xml`, and one `html.<name>` builder per catalog entry. The
//! request environment is pre-bound as the `params` and `headers` arrays
//! and the `body` scalar.

use std::cell::RefCell;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;

use molt::types::*;
use molt::{molt_err, molt_ok, Interp};

use crate::cgi::response::{Response, STATUS_SERVER_ERROR};
use crate::parser::Request;
use crate::template::Host;


/// The fixed catalog of HTML element builders exposed as `html.<name>`.
pub const HTML_TAGS: &[&str] = &[
    "!DOCTYPE", "a", "abbr", "acronym", "address", "applet", "area", "article", "aside", "audio",
    "b", "base", "basefont", "bdi", "bdo", "big", "blockquote", "body", "br", "button", "canvas",
    "caption", "center", "cite", "code", "col", "colgroup", "data", "datalist", "dd", "del",
    "details", "dfn", "dialog", "dir", "div", "dl", "dt", "em", "embed", "fieldset", "figcaption",
    "figure", "font", "footer", "form", "frame", "frameset", "h1", "head", "header", "hr", "html",
    "i", "iframe", "img", "input", "ins", "kbd", "label", "legend", "li", "link", "main", "map",
    "mark", "meta", "meter", "nav", "noframes", "noscript", "object", "ol", "optgroup", "option",
    "output", "p", "param", "picture", "pre", "progress", "q", "rp", "rt", "ruby", "s", "samp",
    "script", "section", "select", "small", "source", "span", "strike", "strong", "style", "sub",
    "summary", "sup", "svg", "table", "tbody", "td", "template", "textarea", "tfoot", "th",
    "thead", "time", "title", "tr", "track", "tt", "u", "ul", "var", "video", "wbr",
];


/// Host-side state shared between the interpreter commands and the
/// template scanner.
#[derive(Debug)]
struct State<W> {
    response: Response<W>,
    path: PathBuf,
    terminate: bool,
    died: bool,
    last_error: Option<String>,
}

impl<W: Write> State<W> {
    /// Produces the `500` response and halts template execution.
    ///
    /// An empty `msg` falls back to the last trapped script error.
    fn die(&mut self, msg: &str) {
        if self.died {
            return;
        }
        self.died = true;
        self.terminate = true;

        let msg = if msg.is_empty() {
            self.last_error.as_deref().unwrap_or("unknown error")
        } else {
            msg
        };
        tracing::debug!(template = %self.path.display(), error = msg, "template died");
        self.response.respond_error(STATUS_SERVER_ERROR, &format!("<pre>{msg}</pre>"));
    }
}

type Shared<W> = Rc<RefCell<State<W>>>;


/// An isolated script context serving a single request.
///
/// Implements [`Host`] for the template scanner. The response buffer
/// lives inside the sandbox; `Sandbox::ensure_flushed` finalizes it after
/// the template has run.
pub struct Sandbox<W: Write + 'static> {
    interp: Interp,
    shared: Shared<W>,
}

impl<W: Write + 'static> Sandbox<W> {
    /// Creates a sandbox around the response buffer for the template at
    /// `path` (used in diagnostics).
    pub fn new(response: Response<W>, path: PathBuf) -> Self {
        let mut interp = Interp::new();
        let shared = Rc::new(RefCell::new(State {
            response,
            path,
            terminate: false,
            died: false,
            last_error: None,
        }));

        let context = interp.save_context(shared.clone());
        let commands: &[(&str, CommandFunc)] = &[
            ("puts", cmd_puts::<W>),
            ("@", cmd_puts::<W>),
            ("header", cmd_header::<W>),
            ("flush", cmd_flush::<W>),
            ("die", cmd_die::<W>),
            ("exit", cmd_exit::<W>),
            ("xml", cmd_xml::<W>),
        ];
        for &(name, func) in commands {
            interp.add_context_command(name, func, context);
        }
        for tag in HTML_TAGS {
            interp.add_context_command(&format!("html.{tag}"), cmd_html_tag::<W>, context);
        }

        Self { interp, shared }
    }

    /// Binds the request parameters as the `params` array.
    pub fn bind_params(&mut self, params: &[(String, String)]) {
        for (name, value) in params {
            self.set_var(&format!("params({name})"), Value::from(value.as_str()));
        }
    }

    /// Binds the request environment as the `headers` array.
    pub fn bind_headers(&mut self, request: &Request) {
        for (name, value) in request.env_iter() {
            let value = String::from_utf8_lossy(value).into_owned();
            self.set_var(&format!("headers({name})"), Value::from(value));
        }
    }

    /// Binds the raw request body as the `body` scalar.
    pub fn bind_body(&mut self, body: &[u8]) {
        let body = String::from_utf8_lossy(body).into_owned();
        self.set_var("body", Value::from(body));
    }

    /// Whether template execution failed through `die`.
    #[must_use]
    pub fn died(&self) -> bool {
        self.shared.borrow().died
    }

    /// Routes a host-side failure (such as an unreadable template) through
    /// the sandbox's error response.
    pub fn fail(&mut self, msg: &str) {
        self.shared.borrow_mut().die(msg);
    }

    /// Flushes the response unless a flush already happened.
    pub fn ensure_flushed(&mut self) {
        self.shared.borrow_mut().response.flush();
    }

    // Variables are set by evaluating a canonically-quoted `set` command,
    // which delegates all quoting concerns to the list formatter.
    fn set_var(&mut self, name: &str, value: Value) {
        let script = command(&[Value::from("set"), Value::from(name), value]);
        if let Err(e) = self.interp.eval(&script) {
            tracing::warn!(name, error = %e.value().as_str(), "binding variable failed");
        }
    }
}

impl<W: Write + 'static> Host for Sandbox<W> {
    fn emit(&mut self, html: &str) {
        self.shared.borrow_mut().response.append_body(html.as_bytes());
    }

    fn exec(&mut self, script: &str, line: u32) {
        if self.shared.borrow().died {
            return;
        }
        if let Err(exc) = self.interp.eval(script) {
            if self.shared.borrow().died {
                // die() already produced the response
                return;
            }
            let msg = exc.value().as_str().to_owned();
            tracing::debug!(line, error = %msg, "template fragment failed");
            let located = {
                let state = self.shared.borrow();
                format!("{}:{line} -- {msg}", state.path.display())
            };
            let mut state = self.shared.borrow_mut();
            state.last_error = Some(msg);
            state.die(&located);
        }
    }

    fn is_complete(&mut self, script: &str) -> bool {
        self.interp.complete(script)
    }

    fn die(&mut self, msg: &str) {
        self.shared.borrow_mut().die(msg);
    }

    fn terminated(&self) -> bool {
        let state = self.shared.borrow();
        state.terminate || state.died
    }
}


/// Formats words as a canonical list, which evaluates as a single
/// correctly-quoted command.
fn command(words: &[Value]) -> String {
    Value::from(words.to_vec()).as_str().to_owned()
}

fn with_state<W: Write + 'static, R>(
    interp: &mut Interp,
    context: ContextID,
    f: impl FnOnce(&mut State<W>) -> R,
) -> R {
    let shared = interp.context::<Shared<W>>(context).clone();
    let mut state = shared.borrow_mut();
    f(&mut state)
}

/// `puts data...` / `@ data...` — append to the response body.
///
/// A single argument is appended verbatim. Several arguments are joined
/// and evaluated as an expression, so `@ 1 + 2` emits `3`.
fn cmd_puts<W: Write + 'static>(
    interp: &mut Interp,
    context: ContextID,
    argv: &[Value],
) -> MoltResult {
    if argv.len() < 2 {
        return molt_err!("wrong # args: should be \"{} data ?data ...?\"", argv[0].as_str());
    }
    let data = if argv.len() == 2 {
        argv[1].as_str().to_owned()
    } else {
        let joined = argv[1..]
            .iter()
            .map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        let result = interp.eval(&command(&[Value::from("expr"), Value::from(joined)]))?;
        result.as_str().to_owned()
    };
    with_state::<W, _>(interp, context, |state| {
        state.response.append_body(data.as_bytes());
    });
    molt_ok!()
}

/// `header key value ?replace?` — set a response header.
fn cmd_header<W: Write + 'static>(
    interp: &mut Interp,
    context: ContextID,
    argv: &[Value],
) -> MoltResult {
    if !(3..=4).contains(&argv.len()) {
        return molt_err!("wrong # args: should be \"header key value ?replace?\"");
    }
    let replace = match argv.get(3) {
        None => true,
        Some(v) => match v.as_str().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => return molt_err!("expected boolean value but got \"{}\"", other),
        },
    };
    with_state::<W, _>(interp, context, |state| {
        state.response.set_header(argv[1].as_str(), argv[2].as_str(), replace);
    });
    molt_ok!()
}

/// `flush` — finalize and transmit the response.
fn cmd_flush<W: Write + 'static>(
    interp: &mut Interp,
    context: ContextID,
    argv: &[Value],
) -> MoltResult {
    molt::check_args(1, argv, 1, 1, "")?;
    with_state::<W, _>(interp, context, |state| state.response.flush());
    molt_ok!()
}

/// `die ?msg?` — respond with a 500 and stop template execution.
fn cmd_die<W: Write + 'static>(
    interp: &mut Interp,
    context: ContextID,
    argv: &[Value],
) -> MoltResult {
    let msg = argv.get(1).map(|v| v.as_str().to_owned()).unwrap_or_default();
    with_state::<W, _>(interp, context, |state| state.die(&msg));
    // Unwind the rest of the fragment; exec() sees the died flag
    molt_err!("died")
}

/// `exit` — cooperatively end template execution after this fragment.
fn cmd_exit<W: Write + 'static>(
    interp: &mut Interp,
    context: ContextID,
    _argv: &[Value],
) -> MoltResult {
    with_state::<W, _>(interp, context, |state| state.terminate = true);
    molt_ok!()
}

/// `xml args...` — emit an `<?xml ... ?>` declaration.
///
/// Templates cannot spell the declaration literally, since `<?` opens a
/// script fragment; the fragment `xml version='1.0'` re-creates it.
fn cmd_xml<W: Write + 'static>(
    interp: &mut Interp,
    context: ContextID,
    argv: &[Value],
) -> MoltResult {
    let args = argv[1..]
        .iter()
        .map(Value::as_str)
        .collect::<Vec<_>>()
        .join(" ");
    with_state::<W, _>(interp, context, |state| {
        state.response.append_body(format!("<?xml {args}?>").as_bytes());
    });
    molt_ok!()
}

/// `html.<tag> ?attrs? ?child ...?` — serialize an HTML element.
///
/// `attrs` is a list of alternating attribute names and values. The
/// element string is returned, not emitted, so builders compose; `puts`
/// (or `@`) sends the final markup to the body.
fn cmd_html_tag<W: Write + 'static>(
    _interp: &mut Interp,
    _context: ContextID,
    argv: &[Value],
) -> MoltResult {
    let name = argv[0].as_str();
    let tag = name.strip_prefix("html.").unwrap_or(name);

    let mut out = format!("<{tag}");
    if let Some(attrs) = argv.get(1) {
        let attrs = attrs.as_list()?;
        for pair in attrs.chunks(2) {
            let key = pair[0].as_str();
            let value = pair.get(1).map_or("", |v| v.as_str());
            out.push_str(&format!(" {key}='{value}'"));
        }
    }

    let children = argv.get(2..).unwrap_or(&[]);
    if children.is_empty() {
        out.push_str(" />");
    } else {
        out.push('>');
        for child in children {
            out.push_str(child.as_str());
        }
        out.push_str(&format!("</{tag}>"));
    }
    molt_ok!(out)
}


#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::template;

    /// A clonable byte sink so tests can read what the sandbox flushed.
    #[derive(Debug, Clone, Default)]
    struct SharedSink(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn sandbox() -> (Sandbox<SharedSink>, SharedSink) {
        let sink = SharedSink::default();
        let response = Response::new(sink.clone());
        let sandbox = Sandbox::new(response, PathBuf::from("fixture.tcl"));
        (sandbox, sink)
    }

    fn output(sink: &SharedSink) -> String {
        String::from_utf8(sink.0.borrow().clone()).expect("response output is UTF-8")
    }

    fn body(sink: &SharedSink) -> String {
        let out = output(sink);
        let (_, body) = out.split_once("\n\n").expect("header separator present");
        body.to_owned()
    }

    #[test]
    fn puts_appends() {
        let (mut sandbox, sink) = sandbox();
        sandbox.exec("puts hello", 1);
        sandbox.exec("puts { world}", 1);
        sandbox.ensure_flushed();
        assert_eq!(body(&sink), "hello world");
    }

    #[test]
    fn at_evaluates_expressions() {
        let (mut sandbox, sink) = sandbox();
        sandbox.exec("@ 1 + 2", 1);
        sandbox.ensure_flushed();
        assert!(!sandbox.died());
        assert_eq!(body(&sink), "3");
    }

    #[test]
    fn header_command() {
        let (mut sandbox, sink) = sandbox();
        sandbox.exec("header x-test yes", 1);
        sandbox.exec("header x-test overwritten 0", 1);
        sandbox.ensure_flushed();
        let out = output(&sink);
        assert!(out.contains("X-test: yes\n"));
        assert!(!out.contains("overwritten"));
    }

    #[test]
    fn script_error_produces_500() {
        let (mut sandbox, sink) = sandbox();
        sandbox.exec(" error oops ", 1);
        assert!(sandbox.died());
        assert!(sandbox.terminated());
        let out = output(&sink);
        assert!(out.starts_with("Status: 500 Internal server error\n"));
        let body = body(&sink);
        assert!(body.starts_with("<pre>"));
        assert!(body.contains("oops"));
        assert!(body.contains("fixture.tcl:1"));

        // Execution after a die is inert
        sandbox.exec("puts ignored", 2);
        assert!(!output(&sink).contains("ignored"));
    }

    #[test]
    fn die_command() {
        let (mut sandbox, sink) = sandbox();
        sandbox.exec("puts before\ndie boom\nputs after", 1);
        assert!(sandbox.died());
        let body = body(&sink);
        assert_eq!(body, "<pre>boom</pre>");
    }

    #[test]
    fn exit_is_cooperative() {
        let (mut sandbox, sink) = sandbox();
        sandbox.exec("exit\nputs {after exit}", 1);
        assert!(sandbox.terminated());
        assert!(!sandbox.died());
        sandbox.ensure_flushed();
        // The rest of the fragment still ran
        assert_eq!(body(&sink), "after exit");
        assert!(output(&sink).starts_with("Status: 200\n"));
    }

    #[test]
    fn xml_declaration() {
        let (mut sandbox, sink) = sandbox();
        sandbox.exec("xml version='1.0' encoding='utf-8'", 1);
        sandbox.ensure_flushed();
        assert_eq!(body(&sink), "<?xml version='1.0' encoding='utf-8'?>");
    }

    #[test]
    fn html_builders() {
        let (mut sandbox, sink) = sandbox();
        sandbox.exec("puts [html.p {} hello]", 1);
        sandbox.exec("puts [html.br {}]", 2);
        sandbox.exec("puts [html.br]", 3);
        sandbox.exec("puts [html.div {class box id main} inner]", 4);
        sandbox.exec("puts [html.ul {} [html.li {} one] [html.li {} two]]", 5);
        sandbox.ensure_flushed();
        assert!(!sandbox.died());
        assert_eq!(
            body(&sink),
            "<p>hello</p><br /><br /><div class='box' id='main'>inner</div>\
             <ul><li>one</li><li>two</li></ul>",
        );
    }

    #[test]
    fn prebound_variables() {
        let (mut sandbox, sink) = sandbox();
        sandbox.bind_params(&[("a".to_owned(), "1".to_owned()),
                              ("spaced key".to_owned(), "two words".to_owned())]);
        sandbox.bind_body(b"raw body");
        sandbox.exec("puts $params(a)", 1);
        sandbox.exec("puts ${params(spaced key)}", 2);
        sandbox.exec("puts $body", 3);
        sandbox.ensure_flushed();
        assert!(!sandbox.died(), "{}", output(&sink));
        assert_eq!(body(&sink), "1two wordsraw body");
    }

    #[test]
    fn completeness_check() {
        let (mut sandbox, _sink) = sandbox();
        assert!(sandbox.is_complete("set a 1\n"));
        assert!(!sandbox.is_complete("if {$a} {\n"));
        assert!(sandbox.is_complete("if {$a} { puts b }\n"));
    }

    #[test]
    fn flush_then_drop() {
        let (mut sandbox, sink) = sandbox();
        sandbox.exec("puts first\nflush\nputs late\nheader X-Late no", 1);
        assert!(!sandbox.died());
        let out = output(&sink);
        assert!(out.ends_with("\n\nfirst"));
        assert!(!out.contains("late"));
        assert!(!out.contains("X-late"));
    }

    #[test]
    fn scanner_integration() {
        let (mut sandbox, sink) = sandbox();
        template::run_str(
            &mut sandbox,
            "<p><?@ 1 + 2 ?></p>",
            Path::new("fixture.tcl"),
        );
        sandbox.ensure_flushed();
        assert_eq!(body(&sink), "<p>3</p>\n");
    }
}
