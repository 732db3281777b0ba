//! Sandbox environment builder.
//!
//! A [`SandboxContext`] is a pure value: the private copy of the caller's
//! dataset plus the interpreter prelude rendered from the runtime policy.
//! Building one performs no execution; the executor materializes a fresh
//! interpreter from it per run, so contexts are never shared across attempts
//! or sessions.

use crate::config::PipelineConfig;
use crate::dataset::Dataset;
use serde_json::Value;
use std::collections::HashSet;

/// Global the executor stages the dataset copy under before the prelude runs;
/// the prelude wraps it in the frame shim and deletes the raw binding.
pub(crate) const DATASET_GLOBAL: &str = "_dataset_columns";

/// The restricted execution context for one attempt.
pub struct SandboxContext {
    /// Private, deep copy of the input dataset as a `{column: [values]}` map.
    /// Code run in the sandbox only ever sees this copy.
    pub(crate) dataset_columns: Value,
    /// Python source run before user code: library shims, import guard,
    /// builtins strip.
    pub(crate) prelude: String,
    /// The variable the artifact must be bound to.
    pub(crate) output_variable: String,
}

impl SandboxContext {
    pub fn build(dataset: &Dataset, config: &PipelineConfig) -> Self {
        Self {
            dataset_columns: dataset.to_column_map(),
            prelude: render_prelude(config),
            output_variable: config.validation.output_variable.clone(),
        }
    }
}

fn render_prelude(config: &PipelineConfig) -> String {
    format!(
        "{SANDBOX_PRELUDE}\n{}",
        render_guard_section(
            &config.runtime.allowed_imports,
            &config.runtime.blocked_builtins
        )
    )
}

/// Render the import guard and builtins strip from the policy sets. The
/// allowlist mirrors the static validator's, so code that passed validation
/// can only trip this guard through an indirection the walker cannot see.
fn render_guard_section(allowed: &HashSet<String>, blocked_builtins: &[String]) -> String {
    format!(
        r#"
_allowed_modules = {allowed}
_original_import = builtins.__import__

def _guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
    root = name.split('.')[0]
    if root not in _allowed_modules and name not in _allowed_modules:
        raise ImportError("import of '" + name + "' is not allowed in the sandbox")
    return _original_import(name, globals, locals, fromlist, level)

builtins.__import__ = _guarded_import

_hasattr = hasattr
_delattr = delattr
for _name in {blocked}:
    if _hasattr(builtins, _name):
        _delattr(builtins, _name)
del _name
del _hasattr
del _delattr
"#,
        allowed = python_set_literal(allowed),
        blocked = python_list_literal(blocked_builtins),
    )
}

fn python_set_literal(items: &HashSet<String>) -> String {
    if items.is_empty() {
        return "set()".to_string();
    }
    let mut sorted: Vec<&String> = items.iter().collect();
    sorted.sort();
    format!(
        "{{{}}}",
        sorted
            .iter()
            .map(|s| format!("'{s}'"))
            .collect::<Vec<_>>()
            .join(", ")
    )
}

fn python_list_literal(items: &[String]) -> String {
    format!(
        "[{}]",
        items
            .iter()
            .map(|s| format!("'{s}'"))
            .collect::<Vec<_>>()
            .join(", ")
    )
}

/// Fixed portion of the sandbox setup: the curated library handles.
///
/// The shims cover the slice of the pandas/numpy/plotly surface the
/// generation prompt advertises; they build plain dict/list structures so a
/// finished figure converts straight to Plotly JSON. Seeding `sys.modules`
/// up front is what makes `import plotly.express as px` resolve without any
/// real import machinery.
const SANDBOX_PRELUDE: &str = r#"
import sys
import builtins
import datetime
import math
import json
import re
try:
    import statistics
except ImportError:
    statistics = None

_ModuleType = type(sys)

def _module(name):
    mod = _ModuleType(name)
    sys.modules[name] = mod
    return mod

class DataFrame:
    def __init__(self, data=None):
        if isinstance(data, DataFrame):
            data = data._data
        data = data or {}
        self._data = {str(k): list(v) for k, v in data.items()}

    @property
    def columns(self):
        return list(self._data.keys())

    def __len__(self):
        lengths = [len(v) for v in self._data.values()]
        return max(lengths) if lengths else 0

    def __contains__(self, key):
        return key in self._data

    def __getitem__(self, key):
        if isinstance(key, list):
            return DataFrame({k: self._column(k) for k in key})
        return self._column(key)

    def __setitem__(self, key, values):
        if isinstance(values, (list, tuple)):
            self._data[str(key)] = list(values)
        else:
            self._data[str(key)] = [values] * len(self)

    def _column(self, key):
        if key not in self._data:
            raise KeyError("column '" + str(key) + "' does not exist")
        return list(self._data[key])

    def copy(self):
        return DataFrame(self._data)

    def head(self, n=5):
        return DataFrame({k: v[:n] for k, v in self._data.items()})

    def sort_values(self, by, ascending=True):
        column = self._column(by)
        order = sorted(range(len(column)), key=lambda i: column[i], reverse=not ascending)
        return DataFrame({k: [v[i] for i in order] for k, v in self._data.items()})

    def to_dict(self):
        return {k: list(v) for k, v in self._data.items()}

def _numeric(values):
    return [v for v in values if isinstance(v, (int, float)) and not isinstance(v, bool)]

def _mean(values):
    xs = _numeric(values)
    return sum(xs) / len(xs) if xs else 0.0

def _median(values):
    xs = sorted(_numeric(values))
    if not xs:
        return 0.0
    mid = len(xs) // 2
    return xs[mid] if len(xs) % 2 else (xs[mid - 1] + xs[mid]) / 2

pandas = _module('pandas')
pandas.DataFrame = DataFrame
pandas.isna = lambda value: value is None
pandas.to_datetime = lambda values: values if isinstance(values, str) else list(values)

numpy = _module('numpy')
numpy.mean = _mean
numpy.median = _median
numpy.sum = lambda values: sum(_numeric(values))
numpy.min = lambda values: min(_numeric(values))
numpy.max = lambda values: max(_numeric(values))
numpy.abs = abs
numpy.sqrt = math.sqrt
numpy.floor = math.floor
numpy.ceil = math.ceil
numpy.nan = float('nan')

class Figure:
    def __init__(self, data=None, layout=None):
        if data is None:
            data = []
        elif isinstance(data, dict):
            data = [data]
        self.data = [dict(trace) for trace in data]
        self.layout = dict(layout) if layout is not None else {}

    def add_trace(self, trace, row=None, col=None):
        self.data.append(dict(trace))
        return self

    def update_layout(self, **kwargs):
        self.layout.update(kwargs)
        return self

    def update_traces(self, **kwargs):
        for trace in self.data:
            trace.update(kwargs)
        return self

    def to_dict(self):
        return {'data': [dict(trace) for trace in self.data], 'layout': dict(self.layout)}

    def to_json(self):
        return json.dumps(self.to_dict())

def _trace(kind, kwargs):
    trace = {'type': kind}
    for key, value in kwargs.items():
        if value is None:
            continue
        trace[key] = list(value) if isinstance(value, tuple) else value
    return trace

def _series(frame, selector):
    if selector is None:
        return None
    if isinstance(selector, str):
        if isinstance(frame, DataFrame):
            return frame[selector]
        raise KeyError("column '" + selector + "' does not exist")
    return list(selector)

def _xy_figure(kind, frame, x, y, title, labels, mode=None):
    labels = labels or {}
    trace = {'type': kind}
    xs = _series(frame, x)
    ys = _series(frame, y)
    if xs is not None:
        trace['x'] = xs
    if ys is not None:
        trace['y'] = ys
    if mode is not None:
        trace['mode'] = mode
    layout = {}
    if isinstance(x, str):
        layout['xaxis'] = {'title': labels.get(x, x)}
    if isinstance(y, str):
        layout['yaxis'] = {'title': labels.get(y, y)}
    if title is not None:
        layout['title'] = title
    return Figure(data=[trace], layout=layout)

def _px_bar(data_frame=None, x=None, y=None, title=None, labels=None, **kwargs):
    return _xy_figure('bar', data_frame, x, y, title, labels)

def _px_line(data_frame=None, x=None, y=None, title=None, labels=None, **kwargs):
    return _xy_figure('scatter', data_frame, x, y, title, labels, mode='lines')

def _px_scatter(data_frame=None, x=None, y=None, title=None, labels=None, **kwargs):
    return _xy_figure('scatter', data_frame, x, y, title, labels, mode='markers')

def _px_histogram(data_frame=None, x=None, title=None, labels=None, **kwargs):
    return _xy_figure('histogram', data_frame, x, None, title, labels)

def _px_pie(data_frame=None, names=None, values=None, title=None, **kwargs):
    trace = {'type': 'pie'}
    labels_data = _series(data_frame, names)
    values_data = _series(data_frame, values)
    if labels_data is not None:
        trace['labels'] = labels_data
    if values_data is not None:
        trace['values'] = values_data
    layout = {'title': title} if title is not None else {}
    return Figure(data=[trace], layout=layout)

def make_subplots(rows=1, cols=1, subplot_titles=None, **kwargs):
    layout = {'grid': {'rows': rows, 'columns': cols}}
    if subplot_titles is not None:
        layout['annotations'] = [{'text': t} for t in subplot_titles]
    return Figure(layout=layout)

plotly = _module('plotly')
_express = _module('plotly.express')
_express.bar = _px_bar
_express.line = _px_line
_express.scatter = _px_scatter
_express.histogram = _px_histogram
_express.pie = _px_pie
_graph_objects = _module('plotly.graph_objects')
_graph_objects.Figure = Figure
_graph_objects.Bar = lambda **kwargs: _trace('bar', kwargs)
_graph_objects.Scatter = lambda **kwargs: _trace('scatter', kwargs)
_graph_objects.Pie = lambda **kwargs: _trace('pie', kwargs)
_graph_objects.Histogram = lambda **kwargs: _trace('histogram', kwargs)
_graph_objects.Table = lambda **kwargs: _trace('table', kwargs)
_subplots = _module('plotly.subplots')
_subplots.make_subplots = make_subplots
plotly.express = _express
plotly.graph_objects = _graph_objects
plotly.subplots = _subplots

pd = pandas
np = numpy
px = _express
go = _graph_objects

df = DataFrame(_dataset_columns)
del _dataset_columns
del _module
del _ModuleType
"#;
