//! The incremental parse executor
//!
//! Compiled routines run on an explicit stack of frames, one frame per
//! active routine. When a step needs bytes that have not arrived yet, the
//! executor returns `Suspended` with the whole stack intact; feeding more
//! data re-enters the same step. Steps are written so that everything
//! before their final commit (advancing the cursor, storing a value) is
//! a pure function of the available bytes, which makes re-running a step
//! after suspension safe without saving partial matcher state.
//!
//! ## Design
//!
//! Input is addressed through a stack of scopes. The base scope reads the
//! caller's stream buffer; `parse-from` pushes a scope over an owned,
//! frozen buffer; `parse-at` pushes a scope at another offset of the same
//! buffer; `size` pushes a bounded view that remembers where the parent
//! resumes; a unit filter pushes a scope whose buffer is pumped through
//! the filter from the parent's bytes. Each scope carries its own pending
//! lookahead token; field scopes copy it from the parent on entry and
//! write it back on exit, matching the sharing the attribute semantics
//! require.
//!
//! Failure unwinds the frame stack: every guarded frame still holding a
//! unit instance runs the `%error` hook exactly once, innermost first,
//! scopes and field records truncate to each frame's entry marks, and the
//! original error is re-raised to the caller unchanged.

use std::mem;

use crate::compiler::{FieldId, LitId, Program, RoutineId, SiteId, Step, UnitId};
use crate::error::ParseError;
use crate::expr::{Expr, Scope as ExprScope};
use crate::grammar::{BoxedFilter, LiteralPattern, StopKind, TokenId};
use crate::hooks::Hooks;
use crate::lookahead::Alt;
use crate::matcher::ScanOutcome;
use crate::stream::{StreamBuffer, View};
use crate::value::{Value, ValueOutcome, ValueTypeParser};

/// A lookahead token that has been matched but not yet consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    /// End-of-data was identified as the lookahead
    Eod,
    /// A literal token ending at the absolute offset `end`
    Token { token: TokenId, end: u64 },
}

enum ScopeSource {
    /// Same buffer as the scope below
    Inherit,
    /// A self-contained buffer (`parse-from`)
    Owned(StreamBuffer),
    /// A buffer produced by pumping parent bytes through a filter
    Filtered {
        filter: BoxedFilter,
        buffer: StreamBuffer,
        /// Absolute parent offset consumed by the filter so far
        upstream_pos: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Base,
    Field,
    Redirect,
    Filter,
}

struct InputScope {
    source: ScopeSource,
    cur: View,
    trim: bool,
    lahead: Option<Pending>,
    /// With a `size` attribute: where the parent resumes afterwards
    ncur: Option<u64>,
    kind: ScopeKind,
}

/// A field currently being parsed, between `BeginField` and `EndField`
struct ActiveField {
    field: FieldId,
    /// Whether a redirect scope was pushed under the field scope
    redirect: bool,
}

enum StepState {
    Ready,
    /// A child routine is running for this step
    Calling,
    Counting {
        remaining: u64,
        items: Vec<Value>,
        in_body: bool,
    },
    Iterating {
        items: Vec<Value>,
        in_body: bool,
    },
}

struct Frame {
    routine: RoutineId,
    pc: usize,
    state: StepState,
    produced: Option<Value>,
    scope_mark: usize,
    unit_mark: usize,
    field_mark: usize,
}

/// The complete resumable state of one parse run
pub(crate) struct RunState {
    frames: Vec<Frame>,
    scopes: Vec<InputScope>,
    fields: Vec<ActiveField>,
    units: Vec<crate::value::UnitValue>,
    /// Value handed up by the frame that popped most recently
    returned: Option<Option<Value>>,
    /// Constructor arguments staged by a `Call`, consumed by the next
    /// `InitUnit`
    staged_args: Vec<(String, Value)>,
    result: Option<Value>,
}

impl RunState {
    pub(crate) fn new(program: &Program, start: Option<View>, primary: &StreamBuffer) -> Self {
        let (cur, trim) = match start {
            Some(view) => (view, false),
            // Programs with parse-at fields revisit earlier offsets, so
            // consumed bytes must stay retained.
            None => (View::open(primary.start_offset()), !program.random_access),
        };
        RunState {
            frames: vec![Frame {
                routine: program.root,
                pc: 0,
                state: StepState::Ready,
                produced: None,
                scope_mark: 1,
                unit_mark: 0,
                field_mark: 0,
            }],
            scopes: vec![InputScope {
                source: ScopeSource::Inherit,
                cur,
                trim,
                lahead: None,
                ncur: None,
                kind: ScopeKind::Base,
            }],
            fields: Vec::new(),
            units: Vec::new(),
            returned: None,
            staged_args: Vec::new(),
            result: None,
        }
    }

    fn top(&self) -> &InputScope {
        &self.scopes[self.scopes.len() - 1]
    }

    fn top_mut(&mut self) -> &mut InputScope {
        let i = self.scopes.len() - 1;
        &mut self.scopes[i]
    }

    /// Move the current position forward, trimming the backing buffer
    /// when this scope trims
    fn advance_to(&mut self, primary: &mut StreamBuffer, pos: u64) {
        self.top_mut().cur.advance_to(pos);
        if !self.top().trim {
            return;
        }
        for i in (0..self.scopes.len()).rev() {
            match &mut self.scopes[i].source {
                ScopeSource::Inherit => continue,
                ScopeSource::Owned(b) => {
                    b.trim(pos);
                    return;
                }
                ScopeSource::Filtered { buffer, .. } => {
                    buffer.trim(pos);
                    return;
                }
            }
        }
        primary.trim(pos);
    }

    /// Feed every filter scope with whatever upstream bytes have arrived
    fn pump(&mut self, primary: &StreamBuffer) -> Result<(), ParseError> {
        for i in 0..self.scopes.len() {
            if matches!(self.scopes[i].source, ScopeSource::Filtered { .. }) {
                self.pump_one(i, primary)?;
            }
        }
        Ok(())
    }

    fn pump_one(&mut self, i: usize, primary: &StreamBuffer) -> Result<(), ParseError> {
        let (lower, upper) = self.scopes.split_at_mut(i);
        if let ScopeSource::Filtered {
            filter,
            buffer,
            upstream_pos,
        } = &mut upper[0].source
        {
            if buffer.is_frozen() {
                return Ok(());
            }
            let parent_end = lower[i - 1].cur.end;
            let pbuf = resolve_buffer(lower, primary);
            let upstream = View {
                begin: *upstream_pos,
                end: parent_end,
            };
            let chunk = pbuf.view_bytes(&upstream);
            let at_final = pbuf.view_is_final(&upstream);
            if chunk.is_empty() && !at_final {
                return Ok(());
            }
            let out = filter(chunk, at_final)?;
            *upstream_pos += chunk.len() as u64;
            if !out.is_empty() {
                buffer.append(&out);
            }
            if at_final {
                buffer.freeze();
            }
        }
        Ok(())
    }
}

/// Bytes visible to the top scope right now
fn resolve_buffer<'a>(scopes: &'a [InputScope], primary: &'a StreamBuffer) -> &'a StreamBuffer {
    for s in scopes.iter().rev() {
        match &s.source {
            ScopeSource::Inherit => continue,
            ScopeSource::Owned(b) => return b,
            ScopeSource::Filtered { buffer, .. } => return buffer,
        }
    }
    primary
}

/// What `run` returns when it stops
pub(crate) enum RunOutcome {
    Done { value: Value, remaining: View },
    Suspended,
}

enum Flow {
    Advance,
    Stay,
    Push(RoutineId),
    Suspend,
}

enum AcquireStatus {
    Found(Pending),
    NoneMatched,
    Suspend,
}

pub(crate) struct Executor<'a> {
    pub(crate) program: &'a Program,
    pub(crate) st: &'a mut RunState,
    pub(crate) data: &'a mut StreamBuffer,
    pub(crate) hooks: &'a mut dyn Hooks,
    pub(crate) values: &'a dyn ValueTypeParser,
}

impl Executor<'_> {
    pub(crate) fn run(mut self) -> Result<RunOutcome, ParseError> {
        loop {
            let Some(frame) = self.st.frames.last() else {
                let value = self.st.result.take().unwrap_or(Value::Null);
                let remaining = self.st.scopes[0].cur;
                return Ok(RunOutcome::Done { value, remaining });
            };
            let routine = self.program.routine(frame.routine);
            if frame.pc >= routine.steps.len() {
                if let Some(done) = self.st.frames.pop() {
                    if self.st.frames.is_empty() {
                        self.st.result = Some(done.produced.unwrap_or(Value::Null));
                    } else {
                        self.st.returned = Some(done.produced);
                    }
                }
                continue;
            }
            let step = routine.steps[frame.pc].clone();
            match self.exec(step) {
                Ok(Flow::Advance) => {
                    if let Some(f) = self.st.frames.last_mut() {
                        f.pc += 1;
                        f.state = StepState::Ready;
                    }
                }
                Ok(Flow::Stay) => {}
                Ok(Flow::Push(routine)) => self.push_frame(routine),
                Ok(Flow::Suspend) => return Ok(RunOutcome::Suspended),
                Err(e) => return Err(self.unwind(e)),
            }
        }
    }

    fn exec(&mut self, step: Step) -> Result<Flow, ParseError> {
        match step {
            Step::MatchLiteral { lit } => self.match_literal(lit),
            Step::ParseValue { ty } => self.parse_value(&ty),
            Step::Call { routine, args } => {
                if self.is_calling() {
                    let v = self.take_return();
                    self.produce_opt(v);
                    Ok(Flow::Advance)
                } else {
                    if !args.is_empty() {
                        let staged = {
                            let scope = self.expr_scope();
                            let mut staged = Vec::with_capacity(args.len());
                            for (name, expr) in &args {
                                staged.push((name.clone(), expr.eval(&scope)?));
                            }
                            staged
                        };
                        self.st.staged_args = staged;
                    }
                    self.set_state(StepState::Calling);
                    Ok(Flow::Push(routine))
                }
            }
            Step::Dispatch { site } => self.dispatch(site),
            Step::Switch {
                selector,
                cases,
                default,
            } => self.switch(&selector, &cases, default),
            Step::Counter {
                count,
                body,
                container,
            } => self.counter(&count, body, container),
            Step::ForEach {
                body,
                eod_ok,
                container,
            } => self.for_each(body, eod_ok, container),
            Step::BeginField { field } => self.begin_field(field),
            Step::EndField { field } => self.end_field(field),
            Step::InitUnit { unit } => self.init_unit(unit),
            Step::InstallFilter { unit } => self.install_filter(unit),
            Step::Finalize { unit } => self.finalize(unit),
        }
    }

    // ------------------------------------------------------------------
    // terminals

    fn match_literal(&mut self, lit: LitId) -> Result<Flow, ParseError> {
        let cl = self.program.literal(lit);
        if let Some(pending) = self.st.top().lahead {
            return match pending {
                Pending::Token { token, end } if token == cl.token => {
                    let begin = self.st.top().cur.begin;
                    let bytes = resolve_buffer(&self.st.scopes, self.data)
                        .slice(begin, end)
                        .to_vec();
                    self.st.top_mut().lahead = None;
                    self.st.advance_to(self.data, end);
                    self.produce(Value::Bytes(bytes));
                    Ok(Flow::Advance)
                }
                Pending::Token { .. } => Err(self.err("no expected look-ahead token found")),
                Pending::Eod => Err(self.err(format!(
                    "unexpected end-of-data while matching literal {}",
                    cl.pattern
                ))),
            };
        }

        self.st.pump(self.data)?;
        match &cl.pattern {
            LiteralPattern::Bytes(pat) => {
                enum D {
                    Matched,
                    Wait,
                    ShortFinal,
                    Mismatch,
                }
                let d = {
                    let (avail, at_final) = self.peek();
                    let k = avail.len().min(pat.len());
                    if avail[..k] != pat[..k] {
                        D::Mismatch
                    } else if avail.len() >= pat.len() {
                        D::Matched
                    } else if at_final {
                        D::ShortFinal
                    } else {
                        D::Wait
                    }
                };
                match d {
                    D::Matched => {
                        let end = self.st.top().cur.begin + pat.len() as u64;
                        let bytes = pat.clone();
                        self.st.advance_to(self.data, end);
                        self.produce(Value::Bytes(bytes));
                        Ok(Flow::Advance)
                    }
                    D::Wait => Ok(Flow::Suspend),
                    D::ShortFinal => Err(self.err(format!(
                        "unexpected end-of-data while matching literal {}",
                        cl.pattern
                    ))),
                    D::Mismatch => {
                        Err(self.err(format!("failed to match literal {}", cl.pattern)))
                    }
                }
            }
            LiteralPattern::Regex(_) => {
                let Some(matcher) = &cl.matcher else {
                    return Err(self.err(format!("failed to match literal {}", cl.pattern)));
                };
                enum D {
                    Matched(Vec<u8>),
                    Wait,
                    ShortFinal,
                    Mismatch,
                }
                let d = {
                    let (avail, at_final) = self.peek();
                    match matcher.scan(avail, at_final) {
                        ScanOutcome::Match { len, .. } | ScanOutcome::Tie { len } => {
                            D::Matched(avail[..len].to_vec())
                        }
                        ScanOutcome::NeedMore => D::Wait,
                        ScanOutcome::NoMatch { alive } => {
                            if alive && at_final {
                                D::ShortFinal
                            } else {
                                D::Mismatch
                            }
                        }
                    }
                };
                match d {
                    D::Matched(bytes) => {
                        let end = self.st.top().cur.begin + bytes.len() as u64;
                        self.st.advance_to(self.data, end);
                        self.produce(Value::Bytes(bytes));
                        Ok(Flow::Advance)
                    }
                    D::Wait => Ok(Flow::Suspend),
                    D::ShortFinal => Err(self.err(format!(
                        "unexpected end-of-data while matching literal {}",
                        cl.pattern
                    ))),
                    D::Mismatch => {
                        Err(self.err(format!("failed to match literal {}", cl.pattern)))
                    }
                }
            }
        }
    }

    fn parse_value(&mut self, ty: &crate::value::ValueType) -> Result<Flow, ParseError> {
        self.st.pump(self.data)?;
        let (outcome, at_final) = {
            let (avail, at_final) = self.peek();
            (self.values.parse(ty, avail, at_final)?, at_final)
        };
        match outcome {
            ValueOutcome::Complete { value, consumed } => {
                let end = self.st.top().cur.begin + consumed as u64;
                self.st.advance_to(self.data, end);
                self.produce(value);
                Ok(Flow::Advance)
            }
            ValueOutcome::NeedMoreData { .. } => {
                if at_final {
                    Err(self.err("unexpected end-of-data while parsing value"))
                } else {
                    Ok(Flow::Suspend)
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // lookahead

    fn dispatch(&mut self, site_id: SiteId) -> Result<Flow, ParseError> {
        if self.is_calling() {
            let v = self.take_return();
            self.produce_opt(v);
            return Ok(Flow::Advance);
        }

        let pending = match self.st.top().lahead {
            Some(p) => Some(p),
            None => match self.acquire(site_id)? {
                AcquireStatus::Suspend => return Ok(Flow::Suspend),
                AcquireStatus::Found(p) => {
                    self.st.top_mut().lahead = Some(p);
                    Some(p)
                }
                AcquireStatus::NoneMatched => None,
            },
        };

        let site = self.program.site(site_id);
        let alt = match pending {
            Some(Pending::Token { token, .. }) => match site.table.alternative_for(token) {
                Some(alt) => alt,
                None => return Err(self.err("no expected look-ahead token found")),
            },
            Some(Pending::Eod) => match site.table.eod_goes {
                Some(alt) => alt,
                None => {
                    return Err(
                        self.err("expected look-ahead token, but reached end-of-data")
                    )
                }
            },
            None => match site.table.none_goes {
                Some(alt) => alt,
                None => return Err(self.err("no expected look-ahead token found")),
            },
        };
        let routine = match alt {
            Alt::First => site.alt1,
            Alt::Second => site.alt2,
        };
        self.set_state(StepState::Calling);
        Ok(Flow::Push(routine))
    }

    /// Identify the lookahead token at the current position
    ///
    /// Pure until the caller stores the result, so re-running after a
    /// suspension repeats the whole scan over the grown input.
    fn acquire(&mut self, site_id: SiteId) -> Result<AcquireStatus, ParseError> {
        self.st.pump(self.data)?;
        let site = self.program.site(site_id);
        let begin = self.st.top().cur.begin;

        enum Computed {
            Status(AcquireStatus),
            Ambiguous,
        }
        let computed = {
            let (avail, at_final) = self.peek();
            if avail.is_empty() && at_final {
                Computed::Status(AcquireStatus::Found(Pending::Eod))
            } else {
                let mut need_more = false;
                // Some candidate was still viable when the final input
                // ran out; end-of-data is then the identified token.
                let mut alive = false;
                let mut best: Option<(TokenId, usize)> = None;
                let mut tie_len: Option<usize> = None;

                if let Some(matcher) = &site.matcher {
                    match matcher.scan(avail, at_final) {
                        ScanOutcome::Match { token, len } => {
                            best = Some((token, len));
                        }
                        ScanOutcome::Tie { len } => tie_len = Some(len),
                        ScanOutcome::NeedMore => need_more = true,
                        ScanOutcome::NoMatch { alive: a } => alive |= a,
                    }
                }

                for (token, pat) in &site.literals {
                    if avail.len() < pat.len() {
                        if pat[..avail.len()] == avail[..] {
                            if at_final {
                                alive = true;
                            } else {
                                need_more = true;
                            }
                        }
                        continue;
                    }
                    if avail[..pat.len()] == pat[..] {
                        match best {
                            None => best = Some((*token, pat.len())),
                            Some((bt, blen)) => {
                                if pat.len() > blen {
                                    best = Some((*token, pat.len()));
                                } else if pat.len() == blen && *token != bt {
                                    tie_len = Some(pat.len());
                                }
                            }
                        }
                    }
                }

                if need_more {
                    Computed::Status(AcquireStatus::Suspend)
                } else {
                    let best_len = best.map(|(_, len)| len).unwrap_or(0);
                    if tie_len.map(|t| t >= best_len).unwrap_or(false) {
                        Computed::Ambiguous
                    } else if let Some((token, len)) = best {
                        Computed::Status(AcquireStatus::Found(Pending::Token {
                            token,
                            end: begin + len as u64,
                        }))
                    } else if at_final && alive {
                        Computed::Status(AcquireStatus::Found(Pending::Eod))
                    } else {
                        Computed::Status(AcquireStatus::NoneMatched)
                    }
                }
            }
        };
        match computed {
            Computed::Status(s) => Ok(s),
            Computed::Ambiguous => Err(self.err("ambiguous look-ahead token match")),
        }
    }

    // ------------------------------------------------------------------
    // structure

    fn switch(
        &mut self,
        selector: &Expr,
        cases: &[(Vec<Expr>, RoutineId)],
        default: Option<RoutineId>,
    ) -> Result<Flow, ParseError> {
        if self.is_calling() {
            let v = self.take_return();
            self.produce_opt(v);
            return Ok(Flow::Advance);
        }
        let chosen = {
            let scope = self.expr_scope();
            let sel = selector.eval(&scope)?;
            let mut chosen = None;
            'outer: for (guards, routine) in cases {
                for guard in guards {
                    if guard.eval(&scope)? == sel {
                        chosen = Some(*routine);
                        break 'outer;
                    }
                }
            }
            chosen.or(default)
        };
        match chosen {
            Some(routine) => {
                self.set_state(StepState::Calling);
                Ok(Flow::Push(routine))
            }
            None => Err(self.err("no matching case in switch statement")),
        }
    }

    fn counter(
        &mut self,
        count: &Expr,
        body: RoutineId,
        container: Option<FieldId>,
    ) -> Result<Flow, ParseError> {
        let state = self.take_state();
        match state {
            StepState::Ready => {
                let n = count.eval_u64(&self.expr_scope())?;
                self.set_state(StepState::Counting {
                    remaining: n,
                    items: Vec::new(),
                    in_body: false,
                });
                Ok(Flow::Stay)
            }
            StepState::Counting {
                remaining,
                mut items,
                in_body,
            } => {
                if in_body {
                    let item = self.take_return().unwrap_or(Value::Null);
                    let stop = self.container_item(container, item, &mut items)?;
                    if stop {
                        self.produce(Value::List(items));
                        return Ok(Flow::Advance);
                    }
                    self.set_state(StepState::Counting {
                        remaining,
                        items,
                        in_body: false,
                    });
                    return Ok(Flow::Stay);
                }
                if remaining == 0 {
                    self.produce(Value::List(items));
                    return Ok(Flow::Advance);
                }
                self.set_state(StepState::Counting {
                    remaining: remaining - 1,
                    items,
                    in_body: true,
                });
                Ok(Flow::Push(body))
            }
            other => {
                self.set_state(other);
                Err(self.err("loop step entered in an unexpected state"))
            }
        }
    }

    fn for_each(
        &mut self,
        body: RoutineId,
        eod_ok: bool,
        container: Option<FieldId>,
    ) -> Result<Flow, ParseError> {
        let state = self.take_state();
        match state {
            StepState::Ready => {
                self.set_state(StepState::Iterating {
                    items: Vec::new(),
                    in_body: false,
                });
                Ok(Flow::Stay)
            }
            StepState::Iterating { mut items, in_body } => {
                if in_body {
                    let item = self.take_return().unwrap_or(Value::Null);
                    let stop = self.container_item(container, item, &mut items)?;
                    if stop {
                        self.produce(Value::List(items));
                        return Ok(Flow::Advance);
                    }
                    self.set_state(StepState::Iterating {
                        items,
                        in_body: false,
                    });
                    return Ok(Flow::Stay);
                }
                if eod_ok {
                    // An element boundary is a legitimate place for the
                    // stream to end; wait until a byte or a freeze decides.
                    self.st.pump(self.data)?;
                    let (empty, at_final) = {
                        let (avail, at_final) = self.peek();
                        (avail.is_empty(), at_final)
                    };
                    match self.st.top().lahead {
                        Some(Pending::Eod) => {
                            self.produce(Value::List(items));
                            return Ok(Flow::Advance);
                        }
                        Some(Pending::Token { .. }) => {}
                        None => {
                            if empty && at_final {
                                self.produce(Value::List(items));
                                return Ok(Flow::Advance);
                            }
                            if empty {
                                self.set_state(StepState::Iterating {
                                    items,
                                    in_body: false,
                                });
                                return Ok(Flow::Suspend);
                            }
                        }
                    }
                }
                self.set_state(StepState::Iterating {
                    items,
                    in_body: true,
                });
                Ok(Flow::Push(body))
            }
            other => {
                self.set_state(other);
                Err(self.err("loop step entered in an unexpected state"))
            }
        }
    }

    /// Apply the stop condition and per-item hook to a parsed loop item
    ///
    /// Returns whether the loop stops after this item. Ordering follows
    /// the stop kind: `until` and `while` test before the hook sees the
    /// item and drop it on stop; `until-including` keeps the item and
    /// tests afterwards.
    fn container_item(
        &mut self,
        container: Option<FieldId>,
        item: Value,
        items: &mut Vec<Value>,
    ) -> Result<bool, ParseError> {
        let Some(fid) = container else {
            return Ok(false);
        };
        let plan = self.program.field(fid);
        let name = plan.name.clone();
        let location = plan.location.clone();
        let transient = plan.attrs.transient;
        let stop_attr = plan.attrs.stop.clone();

        let mut stop = false;
        match stop_attr {
            Some(s) if s.kind == StopKind::Until || s.kind == StopKind::While => {
                let cond = self
                    .eval_bool_with(&s.condition, &item)
                    .map_err(|e| e.or_at(location))?;
                stop = match s.kind {
                    StopKind::Until => cond,
                    _ => !cond,
                };
                if !stop {
                    self.foreach_hook(&name, &item, &mut stop);
                }
                if !stop && !transient {
                    items.push(item);
                }
            }
            Some(s) => {
                // until-including
                self.foreach_hook(&name, &item, &mut stop);
                if !stop && !transient {
                    items.push(item.clone());
                }
                stop = stop
                    || self
                        .eval_bool_with(&s.condition, &item)
                        .map_err(|e| e.or_at(location))?;
            }
            None => {
                self.foreach_hook(&name, &item, &mut stop);
                if !stop && !transient {
                    items.push(item);
                }
            }
        }
        Ok(stop)
    }

    // ------------------------------------------------------------------
    // fields

    fn begin_field(&mut self, fid: FieldId) -> Result<Flow, ParseError> {
        let plan = self.program.field(fid);
        let attrs = plan.attrs.clone();
        let location = plan.location.clone();

        // Evaluate attribute expressions before any scope changes.
        let from_bytes = match &attrs.parse_from {
            Some(e) => {
                let v = e
                    .eval(&self.expr_scope())
                    .map_err(|e| e.or_at(location.clone()))?;
                match v {
                    Value::Bytes(b) => Some(b),
                    _ => {
                        return Err(ParseError::at(
                            "parse-from expression must produce bytes",
                            location,
                        ))
                    }
                }
            }
            None => None,
        };
        let at_offset = match &attrs.parse_at {
            Some(e) => Some(
                e.eval_u64(&self.expr_scope())
                    .map_err(|e| e.or_at(location.clone()))?,
            ),
            None => None,
        };
        let size = match &attrs.size {
            Some(e) => Some(
                e.eval_u64(&self.expr_scope())
                    .map_err(|e| e.or_at(location.clone()))?,
            ),
            None => None,
        };

        let mut redirect = false;
        if let Some(bytes) = from_bytes {
            let len = bytes.len() as u64;
            self.st.scopes.push(InputScope {
                source: ScopeSource::Owned(StreamBuffer::frozen(bytes)),
                cur: View::bounded(0, len),
                trim: false,
                lahead: None,
                ncur: None,
                kind: ScopeKind::Redirect,
            });
            redirect = true;
        } else if let Some(off) = at_offset {
            let retained = resolve_buffer(&self.st.scopes, self.data).start_offset();
            if off < retained {
                return Err(ParseError::at(
                    "parse-at offset precedes the retained input",
                    location,
                ));
            }
            self.st.scopes.push(InputScope {
                source: ScopeSource::Inherit,
                cur: View::open(off),
                trim: false,
                lahead: None,
                ncur: None,
                kind: ScopeKind::Redirect,
            });
            redirect = true;
        }

        let parent = self.st.top();
        let scope = match size {
            Some(n) => InputScope {
                source: ScopeSource::Inherit,
                cur: parent.cur.limit(n),
                trim: parent.trim,
                lahead: parent.lahead,
                ncur: Some(parent.cur.begin + n),
                kind: ScopeKind::Field,
            },
            None => InputScope {
                source: ScopeSource::Inherit,
                cur: parent.cur,
                trim: parent.trim,
                lahead: parent.lahead,
                ncur: None,
                kind: ScopeKind::Field,
            },
        };
        self.st.scopes.push(scope);
        self.st.fields.push(ActiveField {
            field: fid,
            redirect,
        });
        // The field's production starts from a clean slate.
        if let Some(f) = self.st.frames.last_mut() {
            f.produced = None;
        }
        Ok(Flow::Advance)
    }

    fn end_field(&mut self, fid: FieldId) -> Result<Flow, ParseError> {
        let plan = self.program.field(fid);
        let attrs = plan.attrs.clone();
        let name = plan.name.clone();
        let location = plan.location.clone();

        let staged = self.st.frames.last_mut().and_then(|f| f.produced.take());
        let redirect = self.st.fields.pop().map(|af| af.redirect).unwrap_or(false);

        let Some(scope) = self.st.scopes.pop() else {
            return Err(ParseError::at("input scope stack underflow", location));
        };
        if let Some(ncur) = scope.ncur {
            if scope.cur.begin != ncur {
                return Err(ParseError::at("&size amount not consumed", location));
            }
        }
        if redirect {
            self.st.scopes.pop();
        } else {
            let resume = scope.ncur.unwrap_or(scope.cur.begin);
            let parent = self.st.top_mut();
            parent.lahead = scope.lahead;
            parent.cur.advance_to(resume);
        }

        match staged {
            Some(mut value) => {
                if let Some(conv) = &attrs.convert {
                    value = self
                        .eval_with(conv, &value)
                        .map_err(|e| e.or_at(location.clone()))?;
                }
                if let Some(req) = &attrs.requires {
                    let ok = self
                        .eval_bool_with(req, &value)
                        .map_err(|e| e.or_at(location.clone()))?;
                    if !ok {
                        return Err(ParseError::at("&requires failed", location));
                    }
                }
                if !attrs.transient {
                    if let Some(unit) = self.st.units.last_mut() {
                        unit.set(&name, value.clone());
                    }
                }
                if let Some(unit) = self.st.units.last_mut() {
                    self.hooks.on_field(unit, &name, &value);
                }
            }
            None => {
                if let Some(unit) = self.st.units.last_mut() {
                    self.hooks.on_field(unit, &name, &Value::Null);
                }
            }
        }
        Ok(Flow::Advance)
    }

    // ------------------------------------------------------------------
    // units

    fn init_unit(&mut self, uid: UnitId) -> Result<Flow, ParseError> {
        let name = self.program.unit(uid).name.clone();
        let mut unit = crate::value::UnitValue::new(name);
        for (field, value) in mem::take(&mut self.st.staged_args) {
            unit.set(&field, value);
        }
        self.hooks.on_init(&mut unit);
        self.st.units.push(unit);
        Ok(Flow::Advance)
    }

    fn install_filter(&mut self, uid: UnitId) -> Result<Flow, ParseError> {
        if let Some(factory) = &self.program.unit(uid).filter {
            let filter = factory.instantiate();
            let upstream_pos = self.st.top().cur.begin;
            self.st.scopes.push(InputScope {
                source: ScopeSource::Filtered {
                    filter,
                    buffer: StreamBuffer::new(),
                    upstream_pos,
                },
                cur: View::open(0),
                trim: true,
                lahead: None,
                ncur: None,
                kind: ScopeKind::Filter,
            });
        }
        Ok(Flow::Advance)
    }

    fn finalize(&mut self, uid: UnitId) -> Result<Flow, ParseError> {
        let plan = self.program.unit(uid);
        let name = plan.name.clone();
        let requires = plan.requires.clone();
        {
            let scope = self.expr_scope();
            for req in &requires {
                if !req.eval_bool(&scope).map_err(|e| e.or_at(name.clone()))? {
                    return Err(ParseError::at("&requires failed", name));
                }
            }
        }
        if let Some(unit) = self.st.units.last_mut() {
            self.hooks.on_done(unit);
        }
        // Disconnect the unit's filter: the parent resumes after the
        // upstream bytes the filter consumed.
        if self.st.top().kind == ScopeKind::Filter {
            if let Some(scope) = self.st.scopes.pop() {
                if let ScopeSource::Filtered { upstream_pos, .. } = scope.source {
                    self.st.advance_to(self.data, upstream_pos);
                }
            }
        }
        if let Some(unit) = self.st.units.pop() {
            self.produce(Value::Unit(unit));
        }
        Ok(Flow::Advance)
    }

    // ------------------------------------------------------------------
    // failure

    /// Pop every frame, running `%error` hooks and restoring the marks
    fn unwind(&mut self, err: ParseError) -> ParseError {
        while let Some(frame) = self.st.frames.pop() {
            let guarded = self.program.routine(frame.routine).guarded;
            while self.st.units.len() > frame.unit_mark {
                if let Some(mut unit) = self.st.units.pop() {
                    if guarded {
                        self.hooks.on_error(&mut unit, &err);
                    }
                }
            }
            self.st.scopes.truncate(frame.scope_mark.max(1));
            self.st.fields.truncate(frame.field_mark);
        }
        err
    }

    // ------------------------------------------------------------------
    // helpers

    fn push_frame(&mut self, routine: RoutineId) {
        self.st.returned = None;
        self.st.frames.push(Frame {
            routine,
            pc: 0,
            state: StepState::Ready,
            produced: None,
            scope_mark: self.st.scopes.len(),
            unit_mark: self.st.units.len(),
            field_mark: self.st.fields.len(),
        });
    }

    fn peek(&self) -> (&[u8], bool) {
        let top = self.st.top();
        let buf = resolve_buffer(&self.st.scopes, self.data);
        (buf.view_bytes(&top.cur), buf.view_is_final(&top.cur))
    }

    fn is_calling(&self) -> bool {
        matches!(
            self.st.frames.last().map(|f| &f.state),
            Some(StepState::Calling)
        )
    }

    fn take_state(&mut self) -> StepState {
        match self.st.frames.last_mut() {
            Some(f) => mem::replace(&mut f.state, StepState::Ready),
            None => StepState::Ready,
        }
    }

    fn set_state(&mut self, state: StepState) {
        if let Some(f) = self.st.frames.last_mut() {
            f.state = state;
        }
    }

    fn take_return(&mut self) -> Option<Value> {
        self.st.returned.take().flatten()
    }

    fn produce(&mut self, value: Value) {
        if let Some(f) = self.st.frames.last_mut() {
            f.produced = Some(value);
        }
    }

    fn produce_opt(&mut self, value: Option<Value>) {
        if let Some(f) = self.st.frames.last_mut() {
            f.produced = value;
        }
    }

    fn expr_scope(&self) -> ExprScope<'_> {
        ExprScope {
            unit: self.st.units.last(),
            dollar: None,
        }
    }

    fn eval_with(&self, expr: &Expr, dollar: &Value) -> Result<Value, ParseError> {
        let scope = ExprScope {
            unit: self.st.units.last(),
            dollar: Some(dollar),
        };
        expr.eval(&scope)
    }

    fn eval_bool_with(&self, expr: &Expr, dollar: &Value) -> Result<bool, ParseError> {
        let scope = ExprScope {
            unit: self.st.units.last(),
            dollar: Some(dollar),
        };
        expr.eval_bool(&scope)
    }

    fn foreach_hook(&mut self, field: &str, item: &Value, stop: &mut bool) {
        if let Some(unit) = self.st.units.last_mut() {
            self.hooks.on_foreach(unit, field, item, stop);
        }
    }

    fn err(&self, message: impl Into<String>) -> ParseError {
        match self.st.fields.last() {
            Some(af) => ParseError::at(message, self.program.field(af.field).location.clone()),
            None => match self.st.units.last() {
                Some(unit) => ParseError::at(message, unit.type_name().to_string()),
                None => match self.st.frames.last() {
                    Some(f) => {
                        ParseError::at(message, self.program.routine(f.routine).name.clone())
                    }
                    None => ParseError::new(message),
                },
            },
        }
    }
}
