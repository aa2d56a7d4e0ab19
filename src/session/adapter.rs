//! DAP request handlers of a session and translation of engine events into DAP events.

use crate::config::Config;
use crate::dap::channel::{Handlers, JsonMessageChannel, RequestContext};
use crate::dap::protocol::EventKind;
use crate::dap::sourcemap::SourceMap;
use crate::engine::{EngineEvent, SourceBreakpoint, StepKind};
use crate::error::Result;
use crate::muted_error;
use crate::session::{EndReason, Session, SessionInner, SessionState};
use anyhow::{anyhow, bail, Context};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Weak;
use std::thread;
use strum_macros::{Display, EnumString};

/// How the editor started debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum StartReason {
    Launch,
    Attach,
}

/// Options of `launch`/`attach`, given either as a `debugOptions` list or as a `KEY=value;...`
/// `options` string.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DebugOptions {
    pub redirect_output: bool,
    pub wait_on_normal_exit: bool,
    pub wait_on_abnormal_exit: bool,
    pub fix_file_path_case: bool,
    pub debug_stdlib: bool,
    pub django: bool,
    pub flask: bool,
    pub version: Option<String>,
    pub interpreter_options: Option<String>,
    pub web_browser_url: Option<String>,
}

impl DebugOptions {
    pub fn from_arguments(arguments: &Value) -> Self {
        if let Some(options) = arguments.get("options").and_then(Value::as_str) {
            return Self::parse(options);
        }
        let list = arguments
            .get("debugOptions")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Value::as_str).collect::<Vec<_>>())
            .unwrap_or_default();
        Self::from_list(&list)
    }

    /// Build options from the `debugOptions` list. Unknown entries are ignored.
    pub fn from_list(list: &[&str]) -> Self {
        let mut options = DebugOptions::default();
        for &option in list {
            match option {
                "RedirectOutput" => options.redirect_output = true,
                "WaitOnNormalExit" => options.wait_on_normal_exit = true,
                "WaitOnAbnormalExit" => options.wait_on_abnormal_exit = true,
                "FixFilePathCase" => options.fix_file_path_case = true,
                "DebugStdLib" => options.debug_stdlib = true,
                "Django" => options.django = true,
                "Flask" | "Jinja" => options.flask = true,
                unknown => debug!(target: "session", "unknown debug option {unknown}"),
            }
        }
        options
    }

    /// Parse semicolon separated `KEY=value` pairs. Pairs without `=` and unknown keys are
    /// ignored.
    pub fn parse(raw: &str) -> Self {
        fn flag(value: &str) -> bool {
            matches!(value.trim(), "True" | "true" | "1")
        }

        let mut options = DebugOptions::default();
        for pair in raw.split(';') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            match key.trim() {
                "REDIRECT_OUTPUT" => options.redirect_output = flag(value),
                "WAIT_ON_NORMAL_EXIT" => options.wait_on_normal_exit = flag(value),
                "WAIT_ON_ABNORMAL_EXIT" => options.wait_on_abnormal_exit = flag(value),
                "FIX_FILE_PATH_CASE" => options.fix_file_path_case = flag(value),
                "DEBUG_STD_LIB" => options.debug_stdlib = flag(value),
                "DJANGO_DEBUG" => options.django = flag(value),
                "FLASK_DEBUG" => options.flask = flag(value),
                "VERSION" => options.version = Some(value.to_string()),
                "INTERPRETER_OPTIONS" => options.interpreter_options = Some(value.to_string()),
                "WEB_BROWSER_URL" => options.web_browser_url = Some(value.to_string()),
                unknown => debug!(target: "session", "unknown debug option {unknown}"),
            }
        }
        options
    }
}

/// Per-session protocol state.
#[derive(Debug)]
pub(crate) struct AdapterState {
    pub start_reason: Option<StartReason>,
    pub options: DebugOptions,
    pub source_map: SourceMap,
    exited_sent: bool,
    terminated_sent: bool,
}

impl AdapterState {
    pub fn new(config: &Config) -> Self {
        Self {
            start_reason: None,
            options: DebugOptions {
                redirect_output: config.redirect_output,
                ..Default::default()
            },
            source_map: SourceMap::default(),
            exited_sent: false,
            terminated_sent: false,
        }
    }

    fn kill_on_close(&self, config: &Config) -> bool {
        self.start_reason == Some(StartReason::Launch) && config.kill_on_close
    }

    /// Whether ending the session for `reason` kills the debuggee (otherwise the engine detaches).
    pub fn should_terminate(&self, reason: EndReason, config: &Config) -> bool {
        match reason {
            EndReason::Disconnect { terminate } => terminate,
            EndReason::DebuggeeExited => false,
            EndReason::ChannelClosed | EndReason::DaemonClosing => self.kill_on_close(config),
        }
    }

    /// `(normal, abnormal)` wait-on-exit options.
    pub fn wait_on_exit(&self, config: &Config) -> (bool, bool) {
        (
            self.options.wait_on_normal_exit || config.wait_on_normal_exit,
            self.options.wait_on_abnormal_exit || config.wait_on_abnormal_exit,
        )
    }

    /// Return true on the first call, the caller sends the `terminated` event.
    pub fn mark_terminated(&mut self) -> bool {
        !std::mem::replace(&mut self.terminated_sent, true)
    }
}

type RequestHandler = fn(&Session, &RequestContext) -> anyhow::Result<Option<Value>>;

fn bind(
    session: &Weak<SessionInner>,
    handler: RequestHandler,
) -> impl Fn(&RequestContext) -> anyhow::Result<Option<Value>> + Send + Sync + 'static {
    let session = session.clone();
    move |ctx: &RequestContext| {
        let session = Session::from_weak(&session).ok_or_else(|| anyhow!("session is closed"))?;
        handler(&session, ctx)
    }
}

/// Dispatch table of editor requests. Requests not listed here are answered with a failure.
pub(crate) fn handlers(session: Weak<SessionInner>) -> Handlers {
    let table: &[(&str, RequestHandler)] = &[
        ("initialize", initialize),
        ("launch", launch),
        ("attach", attach),
        ("configurationDone", configuration_done),
        ("setBreakpoints", set_breakpoints),
        ("setExceptionBreakpoints", set_exception_breakpoints),
        ("threads", threads),
        ("stackTrace", stack_trace),
        ("scopes", scopes),
        ("variables", variables),
        ("evaluate", evaluate),
        ("setVariable", set_variable),
        ("setExpression", set_expression),
        ("exceptionInfo", exception_info),
        ("modules", modules),
        ("continue", resume),
        ("next", next),
        ("stepIn", step_in),
        ("stepOut", step_out),
        ("pause", pause),
        ("disconnect", disconnect),
    ];
    table
        .iter()
        .fold(Handlers::new(), |handlers, (command, handler)| {
            handlers.on_request(command, bind(&session, *handler))
        })
        .on_any_event(|channel, event, _| {
            debug!(target: "session", "{}: ignore event {event} from editor", channel.name());
        })
}

fn capabilities() -> Value {
    json!({
        "supportsConfigurationDoneRequest": true,
        "supportsConditionalBreakpoints": true,
        "supportsHitConditionalBreakpoints": true,
        "supportsLogPoints": true,
        "supportsEvaluateForHovers": true,
        "supportsSetVariable": true,
        "supportsSetExpression": true,
        "supportsExceptionInfoRequest": true,
        "supportsModulesRequest": true,
        "supportsTerminateRequest": false,
        "exceptionBreakpointFilters": [
            {"filter": "raised", "label": "Raised Exceptions", "default": false},
            {"filter": "uncaught", "label": "Uncaught Exceptions", "default": true},
        ],
    })
}

fn initialize(_: &Session, ctx: &RequestContext) -> anyhow::Result<Option<Value>> {
    ctx.after_response(|channel| {
        muted_error!(channel.send_event(EventKind::Initialized.into(), None));
    });
    Ok(Some(capabilities()))
}

fn start_debugging(
    session: &Session,
    ctx: &RequestContext,
    reason: StartReason,
) -> anyhow::Result<Option<Value>> {
    let mut adapter = session.adapter();
    if let Some(started) = adapter.start_reason {
        bail!("debugging is already started by {started}");
    }
    adapter.start_reason = Some(reason);
    adapter.options = DebugOptions::from_arguments(ctx.arguments());
    adapter.source_map = SourceMap::from_arguments(ctx.arguments());
    info!(target: "session", "{}: {reason} with {:?}", session.name(), adapter.options);
    Ok(None)
}

fn launch(session: &Session, ctx: &RequestContext) -> anyhow::Result<Option<Value>> {
    start_debugging(session, ctx, StartReason::Launch)
}

fn attach(session: &Session, ctx: &RequestContext) -> anyhow::Result<Option<Value>> {
    start_debugging(session, ctx, StartReason::Attach)
}

fn configuration_done(session: &Session, _: &RequestContext) -> anyhow::Result<Option<Value>> {
    session.engine().lock().unwrap().configuration_done()?;
    Ok(None)
}

#[derive(Deserialize)]
struct Source {
    path: Option<String>,
}

#[derive(Deserialize)]
struct SetBreakpointsArguments {
    source: Source,
    #[serde(default)]
    breakpoints: Option<Vec<SourceBreakpoint>>,
    /// Deprecated form of `breakpoints`.
    #[serde(default)]
    lines: Option<Vec<i64>>,
}

fn set_breakpoints(session: &Session, ctx: &RequestContext) -> anyhow::Result<Option<Value>> {
    let args: SetBreakpointsArguments =
        serde_json::from_value(ctx.arguments().clone()).context("invalid arguments")?;
    let client_path = args.source.path.context("source path is missing")?;
    let path = session.adapter().source_map.to_engine(&client_path);

    let breakpoints = match (args.breakpoints, args.lines) {
        (Some(breakpoints), _) => breakpoints,
        (None, Some(lines)) => lines
            .into_iter()
            .map(|line| SourceBreakpoint {
                line,
                condition: None,
                hit_condition: None,
                log_message: None,
            })
            .collect(),
        (None, None) => vec![],
    };

    let statuses = session
        .engine()
        .lock()
        .unwrap()
        .set_breakpoints(&path, &breakpoints)?;
    session.breakpoints().lock().unwrap().set(&path, breakpoints);
    Ok(Some(json!({ "breakpoints": statuses })))
}

const EXCEPTION_FILTERS: [&str; 2] = ["raised", "uncaught"];

fn set_exception_breakpoints(
    session: &Session,
    ctx: &RequestContext,
) -> anyhow::Result<Option<Value>> {
    let filters: Vec<String> = ctx
        .arguments()
        .get("filters")
        .map(|filters| serde_json::from_value(filters.clone()))
        .transpose()
        .context("invalid filters")?
        .unwrap_or_default();
    let filters: Vec<String> = filters
        .into_iter()
        .filter(|filter| {
            let known = EXCEPTION_FILTERS.contains(&filter.as_str());
            if !known {
                warn!(target: "session", "unknown exception filter {filter}");
            }
            known
        })
        .collect();

    session
        .engine()
        .lock()
        .unwrap()
        .set_exception_breakpoints(&filters)?;
    session
        .breakpoints()
        .lock()
        .unwrap()
        .set_exception_filters(filters);
    Ok(None)
}

fn threads(session: &Session, _: &RequestContext) -> anyhow::Result<Option<Value>> {
    Ok(Some(session.engine().lock().unwrap().threads()?))
}

fn stack_trace(session: &Session, ctx: &RequestContext) -> anyhow::Result<Option<Value>> {
    let mut body = session.engine().lock().unwrap().stack_trace(ctx.arguments())?;
    let adapter = session.adapter();
    if adapter.source_map.is_empty() {
        return Ok(Some(body));
    }
    if let Some(frames) = body.get_mut("stackFrames").and_then(Value::as_array_mut) {
        for frame in frames {
            let Some(path) = frame.get_mut("source").and_then(|s| s.get_mut("path")) else {
                continue;
            };
            if let Some(engine_path) = path.as_str() {
                *path = Value::String(adapter.source_map.to_client(engine_path));
            }
        }
    }
    Ok(Some(body))
}

fn scopes(session: &Session, ctx: &RequestContext) -> anyhow::Result<Option<Value>> {
    Ok(Some(session.engine().lock().unwrap().scopes(ctx.arguments())?))
}

fn variables(session: &Session, ctx: &RequestContext) -> anyhow::Result<Option<Value>> {
    Ok(Some(session.engine().lock().unwrap().variables(ctx.arguments())?))
}

fn evaluate(session: &Session, ctx: &RequestContext) -> anyhow::Result<Option<Value>> {
    Ok(Some(session.engine().lock().unwrap().evaluate(ctx.arguments())?))
}

fn set_variable(session: &Session, ctx: &RequestContext) -> anyhow::Result<Option<Value>> {
    Ok(Some(session.engine().lock().unwrap().set_variable(ctx.arguments())?))
}

fn set_expression(session: &Session, ctx: &RequestContext) -> anyhow::Result<Option<Value>> {
    Ok(Some(session.engine().lock().unwrap().set_expression(ctx.arguments())?))
}

fn exception_info(session: &Session, ctx: &RequestContext) -> anyhow::Result<Option<Value>> {
    let thread_id = thread_id(ctx).context("threadId is missing")?;
    let mut body = session.engine().lock().unwrap().exception_info(thread_id)?;
    let adapter = session.adapter();
    if let Some(source) = body.pointer_mut("/details/source") {
        if let Some(engine_path) = source.as_str() {
            *source = Value::String(adapter.source_map.to_client(engine_path));
        }
    }
    Ok(Some(body))
}

fn modules(session: &Session, ctx: &RequestContext) -> anyhow::Result<Option<Value>> {
    let mut body = session.engine().lock().unwrap().modules(ctx.arguments())?;
    let adapter = session.adapter();
    if let Some(modules) = body.get_mut("modules").and_then(Value::as_array_mut) {
        for path in modules.iter_mut().filter_map(|m| m.get_mut("path")) {
            if let Some(engine_path) = path.as_str() {
                *path = Value::String(adapter.source_map.to_client(engine_path));
            }
        }
    }
    Ok(Some(body))
}

fn thread_id(ctx: &RequestContext) -> Option<i64> {
    ctx.arguments().get("threadId").and_then(Value::as_i64)
}

fn resume(session: &Session, ctx: &RequestContext) -> anyhow::Result<Option<Value>> {
    session.engine().lock().unwrap().resume(thread_id(ctx))?;
    Ok(Some(json!({ "allThreadsContinued": true })))
}

fn step(session: &Session, ctx: &RequestContext, kind: StepKind) -> anyhow::Result<Option<Value>> {
    let thread_id = thread_id(ctx).context("threadId is missing")?;
    session.engine().lock().unwrap().step(thread_id, kind)?;
    Ok(None)
}

fn next(session: &Session, ctx: &RequestContext) -> anyhow::Result<Option<Value>> {
    step(session, ctx, StepKind::Over)
}

fn step_in(session: &Session, ctx: &RequestContext) -> anyhow::Result<Option<Value>> {
    step(session, ctx, StepKind::In)
}

fn step_out(session: &Session, ctx: &RequestContext) -> anyhow::Result<Option<Value>> {
    step(session, ctx, StepKind::Out)
}

fn pause(session: &Session, ctx: &RequestContext) -> anyhow::Result<Option<Value>> {
    session.engine().lock().unwrap().pause(thread_id(ctx))?;
    Ok(None)
}

fn disconnect(session: &Session, ctx: &RequestContext) -> anyhow::Result<Option<Value>> {
    let terminate = ctx
        .arguments()
        .get("terminateDebuggee")
        .and_then(Value::as_bool)
        .unwrap_or_else(|| session.adapter().kill_on_close(session.config()));

    let weak = session.downgrade();
    ctx.after_response(move |_| {
        if let Some(session) = Session::from_weak(&weak) {
            session.end(EndReason::Disconnect { terminate });
        }
    });
    Ok(None)
}

fn send(channel: &JsonMessageChannel, kind: EventKind, body: Value) -> Result<()> {
    channel.send_event(kind.into(), Some(body))
}

pub(crate) fn send_terminated(channel: &JsonMessageChannel) -> Result<()> {
    channel.send_event(EventKind::Terminated.into(), None)
}

/// Re-emit an engine event to the editor.
pub(crate) fn on_engine_event(session: &Session, event: EngineEvent) {
    if session.state() != SessionState::Active {
        debug!(target: "session", "{}: drop engine event {event:?}", session.name());
        return;
    }
    let channel = session.channel();
    let res = match event {
        EngineEvent::ThreadStarted { thread_id } => send(
            channel,
            EventKind::Thread,
            json!({"reason": "started", "threadId": thread_id}),
        ),
        EngineEvent::ThreadExited { thread_id } => send(
            channel,
            EventKind::Thread,
            json!({"reason": "exited", "threadId": thread_id}),
        ),
        EngineEvent::Stopped {
            thread_id,
            reason,
            description,
        } => {
            let mut body = json!({"reason": reason, "threadId": thread_id});
            if let Some(description) = description {
                body["description"] = Value::String(description);
            }
            send(channel, EventKind::Stopped, body)
        }
        EngineEvent::Continued { thread_id } => {
            let body = match thread_id {
                Some(thread_id) => json!({"threadId": thread_id, "allThreadsContinued": false}),
                None => json!({"allThreadsContinued": true}),
            };
            send(channel, EventKind::Continued, body)
        }
        EngineEvent::Output { category, output } => send(
            channel,
            EventKind::Output,
            json!({"category": category.to_string(), "output": output}),
        ),
        EngineEvent::Process { name, pid } => {
            let start_method = session
                .adapter()
                .start_reason
                .unwrap_or(StartReason::Attach);
            let mut body = json!({
                "name": name,
                "isLocalProcess": true,
                "startMethod": start_method.to_string(),
            });
            if let Some(pid) = pid {
                body["systemProcessId"] = json!(pid);
            }
            send(channel, EventKind::Process, body)
        }
        EngineEvent::Exited { code } => {
            on_debuggee_exited(session, code);
            Ok(())
        }
    };
    muted_error!(res, "send engine event:");
}

/// Report the exit to the editor once, then give it some time to disconnect before the session
/// is ended from this side.
fn on_debuggee_exited(session: &Session, code: i32) {
    let terminated = {
        let mut adapter = session.adapter();
        if std::mem::replace(&mut adapter.exited_sent, true) {
            return;
        }
        adapter.mark_terminated()
    };
    info!(target: "session", "{}: debuggee exited with code {code}", session.name());

    let channel = session.channel();
    muted_error!(send(channel, EventKind::Exited, json!({ "exitCode": code })));
    if terminated {
        muted_error!(send_terminated(channel));
    }

    let session = session.clone();
    let timeout = session.config().disconnect_timeout();
    thread::spawn(move || {
        if !session.wait_closed(timeout) {
            debug!(target: "session", "{}: no disconnect after debuggee exit", session.name());
            session.end(EndReason::DebuggeeExited);
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_debug_options_from_list() {
        let options = DebugOptions::from_arguments(&json!({
            "debugOptions": ["RedirectOutput", "WaitOnAbnormalExit", "Jinja", "Unknown"]
        }));
        assert_eq!(
            options,
            DebugOptions {
                redirect_output: true,
                wait_on_abnormal_exit: true,
                flask: true,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_debug_options_string_wins_over_list() {
        let options = DebugOptions::from_arguments(&json!({
            "debugOptions": ["RedirectOutput"],
            "options": "WAIT_ON_NORMAL_EXIT=True;REDIRECT_OUTPUT=False;VERSION=3.12;garbage;X=1"
        }));
        assert_eq!(
            options,
            DebugOptions {
                wait_on_normal_exit: true,
                version: Some("3.12".to_string()),
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_should_terminate() {
        let config = Config::default();
        let mut state = AdapterState::new(&config);

        struct TestCase {
            start_reason: Option<StartReason>,
            end_reason: EndReason,
            terminate: bool,
        }
        let cases = [
            TestCase {
                start_reason: Some(StartReason::Launch),
                end_reason: EndReason::ChannelClosed,
                terminate: true,
            },
            TestCase {
                start_reason: Some(StartReason::Attach),
                end_reason: EndReason::DaemonClosing,
                terminate: false,
            },
            TestCase {
                start_reason: Some(StartReason::Attach),
                end_reason: EndReason::Disconnect { terminate: true },
                terminate: true,
            },
            TestCase {
                start_reason: Some(StartReason::Launch),
                end_reason: EndReason::DebuggeeExited,
                terminate: false,
            },
            TestCase {
                start_reason: None,
                end_reason: EndReason::ChannelClosed,
                terminate: false,
            },
        ];
        for case in cases {
            state.start_reason = case.start_reason;
            assert_eq!(
                state.should_terminate(case.end_reason, &config),
                case.terminate,
                "{:?}",
                case.end_reason
            );
        }
    }

    #[test]
    fn test_wait_on_exit_falls_back_to_config() {
        let config = Config {
            wait_on_abnormal_exit: true,
            ..Default::default()
        };
        let mut state = AdapterState::new(&config);
        assert_eq!(state.wait_on_exit(&config), (false, true));
        state.options.wait_on_normal_exit = true;
        assert_eq!(state.wait_on_exit(&config), (true, true));
        assert!(state.mark_terminated());
        assert!(!state.mark_terminated());
    }
}
