//! A reusable, restricted Python interpreter for the code execution tool.
//!
//! Each [`Sandbox`] owns a dedicated OS thread that receives scripts over a
//! plain std channel. Only one script runs at a time, and names a script
//! defines are removed once it finishes. Scripts see an allow-listed set of
//! builtins and can import only pure-computation stdlib modules.

use std::collections::HashSet;
use std::ffi::CString;

use pyo3::prelude::*;
use pyo3::types::PyDict;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const ALLOWED_BUILTINS: &[&str] = &[
    "print",
    "len",
    "str",
    "int",
    "float",
    "complex",
    "bool",
    "bytes",
    "list",
    "dict",
    "set",
    "frozenset",
    "tuple",
    "range",
    "enumerate",
    "zip",
    "map",
    "filter",
    "sorted",
    "reversed",
    "iter",
    "next",
    "slice",
    "min",
    "max",
    "sum",
    "abs",
    "round",
    "divmod",
    "pow",
    "any",
    "all",
    "type",
    "isinstance",
    "issubclass",
    "callable",
    "repr",
    "format",
    "hash",
    "chr",
    "ord",
    "bin",
    "hex",
    "oct",
    "object",
    "property",
    "staticmethod",
    "classmethod",
    "super",
    "True",
    "False",
    "None",
    "NotImplemented",
    "Ellipsis",
    "Exception",
    "ArithmeticError",
    "AssertionError",
    "AttributeError",
    "ImportError",
    "IndexError",
    "KeyError",
    "LookupError",
    "NameError",
    "NotImplementedError",
    "OverflowError",
    "RuntimeError",
    "StopIteration",
    "TypeError",
    "ValueError",
    "ZeroDivisionError",
    // Needed by `class` statements.
    "__build_class__",
];

/// Top-level modules a script may import.
pub const ALLOWED_MODULES: &[&str] = &[
    "math",
    "cmath",
    "statistics",
    "datetime",
    "calendar",
    "json",
    "re",
    "string",
    "collections",
    "itertools",
    "functools",
    "fractions",
    "decimal",
    "random",
];

/// Python side of the sandbox: the source guard, the import guard and the
/// per-thread routing of `sys.stdout`/`sys.stderr`.
const SUPPORT_SOURCE: &str = r#"
import ast
import builtins
import threading
import types

FRAME_PREFIXES = ("f_", "gi_", "cr_", "ag_", "tb_", "co_")
_MISSING = object()


def forbidden(name):
    return name.startswith("_") or name.startswith(FRAME_PREFIXES)


def compile_guarded(source):
    tree = ast.parse(source, "<sandbox>", "exec")
    for node in ast.walk(tree):
        if isinstance(node, ast.Attribute) and forbidden(node.attr):
            raise NameError(f"access to '{node.attr}' is not allowed")
        if isinstance(node, ast.Name) and node.id.startswith("__"):
            raise NameError(f"name '{node.id}' is not allowed")
    return compile(tree, "<sandbox>", "exec")


def safe_getattr(obj, name, default=_MISSING):
    if isinstance(name, str) and forbidden(name):
        raise AttributeError(f"access to '{name}' is not allowed")
    if default is _MISSING:
        return getattr(obj, name)
    return getattr(obj, name, default)


def safe_hasattr(obj, name):
    if isinstance(name, str) and forbidden(name):
        return False
    return hasattr(obj, name)


def import_guard(allowed):
    allowed = frozenset(allowed)

    def root(name):
        return name.partition(".")[0]

    def view(module, seen):
        if module.__name__ in seen:
            return seen[module.__name__]
        public = types.ModuleType(module.__name__)
        seen[module.__name__] = public
        for name in dir(module):
            if forbidden(name):
                continue
            try:
                value = getattr(module, name)
            except AttributeError:
                continue
            if isinstance(value, types.ModuleType):
                if root(value.__name__) not in allowed:
                    continue
                value = view(value, seen)
            setattr(public, name, value)
        return public

    def guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
        if level != 0 or root(name) not in allowed:
            raise ImportError(f"module '{name}' is not available in the sandbox")
        return view(builtins.__import__(name, None, None, fromlist, 0), {})

    return guarded_import


class Route:
    """Writes go to the buffer bound on the current thread, if any."""

    coach_route = True

    def __init__(self, fallback):
        self.fallback = fallback
        self.local = threading.local()

    def bind(self, buffer):
        self.local.buffer = buffer

    def target(self):
        buffer = getattr(self.local, "buffer", None)
        return self.fallback if buffer is None else buffer

    def write(self, text):
        return self.target().write(text)

    def flush(self):
        return self.target().flush()

    def __getattr__(self, name):
        return getattr(self.fallback, name)


def route(stream):
    return stream if getattr(stream, "coach_route", False) else Route(stream)
"#;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to start the Python interpreter: {0}")]
    Init(String),
    #[error("Failed to run the script: {0}")]
    Runtime(String),
    #[error("The Python interpreter is unavailable.")]
    Unavailable,
    #[error("Execution cancelled.")]
    Cancelled,
}

/// Captured result of one script.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// Uncaught exception, rendered as `Type: message`.
    pub exception: Option<String>,
}

struct ExecRequest {
    code: String,
    cancel: CancellationToken,
    reply: oneshot::Sender<Result<ExecOutput, SandboxError>>,
}

/// Interpreter state owned by the sandbox thread.
struct Interpreter {
    support: Py<PyModule>,
    globals: Py<PyDict>,
    baseline: HashSet<String>,
}

impl Interpreter {
    fn open(py: Python<'_>) -> PyResult<Self> {
        let support = load_support(py)?;
        route_std_streams(py, &support)?;
        let (globals, baseline) = prepare_globals(py, &support)?;
        Ok(Self {
            support: support.unbind(),
            globals: globals.unbind(),
            baseline,
        })
    }

    fn run(&self, py: Python<'_>, code: &str) -> Result<ExecOutput, SandboxError> {
        let globals = self.globals.bind(py);
        let result = capture(py, self.support.bind(py), globals, code)
            .map_err(|e| SandboxError::Runtime(e.to_string()));
        if let Err(e) = reset_globals(globals, &self.baseline) {
            warn!("Failed to reset sandbox globals: {}", e);
        }
        result
    }
}

struct PersistentSession {
    tx: std::sync::mpsc::Sender<ExecRequest>,
}

impl PersistentSession {
    async fn spawn() -> Result<Self, SandboxError> {
        let (tx, rx) = std::sync::mpsc::channel::<ExecRequest>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), SandboxError>>();

        std::thread::Builder::new()
            .name("python-sandbox".into())
            .spawn(move || {
                let interpreter = match Python::with_gil(Interpreter::open) {
                    Ok(interpreter) => interpreter,
                    Err(e) => {
                        warn!("Failed to set up the sandbox interpreter: {}", e);
                        let _ = ready_tx.send(Err(SandboxError::Init(e.to_string())));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                debug!("Python sandbox initialized");

                // The GIL is only held while a script runs.
                while let Ok(req) = rx.recv() {
                    if req.cancel.is_cancelled() {
                        debug!("skipping cancelled sandbox request");
                        continue;
                    }
                    let result = Python::with_gil(|py| interpreter.run(py, &req.code));
                    let _ = req.reply.send(result);
                }
                Python::with_gil(|_| drop(interpreter));
                debug!("Python sandbox shutting down");
            })
            .map_err(|e| SandboxError::Init(e.to_string()))?;

        ready_rx.await.map_err(|_| SandboxError::Unavailable)??;
        Ok(Self { tx })
    }
}

/// Handle to one interpreter, started on first use. Dropping the handle
/// stops its thread.
#[derive(Default)]
pub struct Sandbox {
    session: OnceCell<PersistentSession>,
    slot: Mutex<()>,
}

impl Sandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a script. Waits for any running script to finish first; a
    /// cancelled token ends the wait and skips the script if it has not
    /// started yet.
    pub async fn execute(
        &self,
        code: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, SandboxError> {
        let session = self.session.get_or_try_init(PersistentSession::spawn).await?;

        let _slot = tokio::select! {
            guard = self.slot.lock() => guard,
            _ = cancel.cancelled() => return Err(SandboxError::Cancelled),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        session
            .tx
            .send(ExecRequest {
                code: code.to_string(),
                cancel: cancel.clone(),
                reply: reply_tx,
            })
            .map_err(|_| SandboxError::Unavailable)?;

        tokio::select! {
            reply = reply_rx => match reply {
                Ok(result) => result,
                Err(_) if cancel.is_cancelled() => Err(SandboxError::Cancelled),
                Err(_) => Err(SandboxError::Unavailable),
            },
            _ = cancel.cancelled() => Err(SandboxError::Cancelled),
        }
    }
}

fn load_support(py: Python<'_>) -> PyResult<Bound<'_, PyModule>> {
    let source = CString::new(SUPPORT_SOURCE)?;
    PyModule::from_code(py, &source, c"coach_sandbox.py", c"coach_sandbox")
}

/// Replace `sys.stdout` and `sys.stderr` with routes, once per process.
/// Every sandbox thread binds its own buffers to them.
fn route_std_streams(py: Python<'_>, support: &Bound<'_, PyModule>) -> PyResult<()> {
    let sys = py.import("sys")?;
    let route = support.getattr("route")?;
    for name in ["stdout", "stderr"] {
        let stream = sys.getattr(name)?;
        sys.setattr(name, route.call1((stream,))?)?;
    }
    Ok(())
}

/// Fresh globals over the restricted builtins, plus the names they start
/// with.
fn prepare_globals<'py>(
    py: Python<'py>,
    support: &Bound<'py, PyModule>,
) -> PyResult<(Bound<'py, PyDict>, HashSet<String>)> {
    let builtins = py.import("builtins")?;
    let restricted = PyDict::new(py);
    for name in ALLOWED_BUILTINS {
        if let Ok(obj) = builtins.getattr(*name) {
            restricted.set_item(*name, obj)?;
        }
    }
    restricted.set_item("getattr", support.getattr("safe_getattr")?)?;
    restricted.set_item("hasattr", support.getattr("safe_hasattr")?)?;
    let guard = support
        .getattr("import_guard")?
        .call1((ALLOWED_MODULES.to_vec(),))?;
    restricted.set_item("__import__", guard)?;

    let globals = PyDict::new(py);
    globals.set_item("__builtins__", restricted)?;
    globals.set_item("__name__", "__sandbox__")?;

    let baseline = globals
        .keys()
        .iter()
        .map(|key| key.extract::<String>())
        .collect::<PyResult<HashSet<_>>>()?;
    Ok((globals, baseline))
}

fn reset_globals(globals: &Bound<'_, PyDict>, baseline: &HashSet<String>) -> PyResult<()> {
    for key in globals.keys().iter() {
        let added = match key.extract::<String>() {
            Ok(name) => !baseline.contains(&name),
            Err(_) => true,
        };
        if added {
            globals.del_item(key)?;
        }
    }
    Ok(())
}

fn capture(
    py: Python<'_>,
    support: &Bound<'_, PyModule>,
    globals: &Bound<'_, PyDict>,
    code: &str,
) -> PyResult<ExecOutput> {
    let io = py.import("io")?;
    let stdout = io.getattr("StringIO")?.call0()?;
    let stderr = io.getattr("StringIO")?.call0()?;
    let sys = py.import("sys")?;
    let out_route = sys.getattr("stdout")?;
    let err_route = sys.getattr("stderr")?;
    let compile_guarded = support.getattr("compile_guarded")?;
    let exec = py.import("builtins")?.getattr("exec")?;

    out_route.call_method1("bind", (&stdout,))?;
    err_route.call_method1("bind", (&stderr,))?;

    let exception = compile_guarded
        .call1((code,))
        .and_then(|compiled| exec.call1((compiled, globals)))
        .err()
        .map(|e| e.to_string());

    out_route.call_method1("bind", (py.None(),))?;
    err_route.call_method1("bind", (py.None(),))?;

    let output = ExecOutput {
        stdout: stdout.call_method0("getvalue")?.extract()?,
        stderr: stderr.call_method0("getvalue")?.extract()?,
        exception,
    };
    debug!(
        stdout_len = output.stdout.len(),
        stderr_len = output.stderr.len(),
        failed = output.exception.is_some(),
        "Python executed"
    );
    Ok(output)
}
