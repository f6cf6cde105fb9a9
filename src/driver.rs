//! Batch driver: multiplexes independent IVPs across worker threads and
//! lock-step lanes.
//!
//! Every IVP is an embarrassingly parallel unit; the only cross-lane
//! mutable state is the optional work-queue counter (an atomic fetch-add)
//! and the accepted-step log (collected per IVP, appended in IVP order).
//! Workers operate on private copies of each lane's state and hand results
//! back over a channel; the calling thread scatters them into the user's
//! packed buffer, so results are identical regardless of scheduling.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    mpsc, Mutex,
};
use std::thread;

use crate::{
    error::{ConfigError, ErrorCode},
    lane,
    methods::{common::Counters, radau5, rkf45},
    ode::OdeSystem,
    options::{Method, Order, SolverOptions},
    Float,
};

/// Outcome of one IVP in a batch.
#[derive(Clone, Copy, Debug)]
pub struct IvpResult {
    /// Exit code; anything but `Success` must be handled by the caller.
    pub code: ErrorCode,
    /// Step attempts and accepted steps spent on this IVP.
    pub counters: Counters,
}

/// One accepted integration step of one IVP.
#[derive(Clone, Debug)]
pub struct LogRecord {
    pub ivp: usize,
    pub t: Float,
    pub y: Vec<Float>,
}

type StepRecords = Vec<(Float, Vec<Float>)>;

/// Batch integrator for ensembles of independent IVPs.
///
/// Construction validates the configuration and fails fast; `integrate`
/// then mutates the packed state matrix in place and reports a per-IVP
/// [`IvpResult`]. The instance is reusable across calls and the chosen
/// state layout must stay consistent for its lifetime.
#[derive(Debug)]
pub struct Integrator {
    method: Method,
    neq: usize,
    num_workers: usize,
    options: SolverOptions,
    log: Mutex<Vec<LogRecord>>,
}

impl Integrator {
    /// Create a batch integrator for systems of `neq` equations.
    ///
    /// `num_workers` bounds the number of OS threads one `integrate` call
    /// may use. Every configuration problem found is reported, not just
    /// the first.
    pub fn new(
        method: Method,
        neq: usize,
        num_workers: usize,
        options: SolverOptions,
    ) -> Result<Self, Vec<ConfigError>> {
        let mut errors = options.validate(method);
        if neq == 0 {
            errors.push(ConfigError::NeqMustBePositive);
        }
        if num_workers == 0 {
            errors.push(ConfigError::NumWorkersMustBePositive);
        }
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Self {
            method,
            neq,
            num_workers,
            options,
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn neq(&self) -> usize {
        self.neq
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// Integrate `num` IVPs sharing one time interval.
    ///
    /// `p` holds one parameter bundle per IVP, IVP-contiguous; its length
    /// must be a multiple of `num`. `y` is the packed state matrix in the
    /// configured layout and is overwritten with the states at `t_end`.
    pub fn integrate<F: OdeSystem + Sync>(
        &self,
        f: &F,
        num: usize,
        t0: Float,
        t_end: Float,
        p: &[Float],
        y: &mut [Float],
    ) -> Result<Vec<IvpResult>, Vec<ConfigError>> {
        let t0v = vec![t0; num];
        let tev = vec![t_end; num];
        self.integrate_each(f, num, &t0v, &tev, p, y)
    }

    /// Integrate `num` IVPs with per-IVP start and end times.
    pub fn integrate_each<F: OdeSystem + Sync>(
        &self,
        f: &F,
        num: usize,
        t0: &[Float],
        t_end: &[Float],
        p: &[Float],
        y: &mut [Float],
    ) -> Result<Vec<IvpResult>, Vec<ConfigError>> {
        let mut errors = Vec::new();
        if t0.len() != num {
            errors.push(ConfigError::DimensionMismatch {
                what: "t0",
                expected: num,
                got: t0.len(),
            });
        }
        if t_end.len() != num {
            errors.push(ConfigError::DimensionMismatch {
                what: "t_end",
                expected: num,
                got: t_end.len(),
            });
        }
        if y.len() != num * self.neq {
            errors.push(ConfigError::DimensionMismatch {
                what: "y",
                expected: num * self.neq,
                got: y.len(),
            });
        }
        if num > 0 && p.len() % num != 0 {
            errors.push(ConfigError::DimensionMismatch {
                what: "p",
                expected: p.len() - p.len() % num,
                got: p.len(),
            });
        }
        if !errors.is_empty() {
            return Err(errors);
        }
        if num == 0 {
            return Ok(Vec::new());
        }

        if self.options.vector_size > 1 {
            Ok(self.run_lockstep(f, num, t0, t_end, p, y))
        } else {
            Ok(self.run_scalar(f, num, t0, t_end, p, y))
        }
    }

    /// Snapshot of the accepted-step log.
    pub fn step_log(&self) -> Vec<LogRecord> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Flatten the accepted-step log into parallel time / state buffers,
    /// one record per accepted step, states row-major.
    pub fn get_log(&self, times: &mut Vec<Float>, phi: &mut Vec<Float>) {
        if let Ok(log) = self.log.lock() {
            for record in log.iter() {
                times.push(record.t);
                phi.extend_from_slice(&record.y);
            }
        }
    }

    pub fn clear_log(&self) {
        if let Ok(mut log) = self.log.lock() {
            log.clear();
        }
    }

    fn gather(&self, y: &[Float], num: usize, i: usize, buf: &mut [Float]) {
        match self.options.order {
            Order::RowMajor => buf.copy_from_slice(&y[i * self.neq..(i + 1) * self.neq]),
            Order::ColMajor => {
                for k in 0..self.neq {
                    buf[k] = y[k * num + i];
                }
            }
        }
    }

    fn scatter(&self, buf: &[Float], num: usize, i: usize, y: &mut [Float]) {
        match self.options.order {
            Order::RowMajor => y[i * self.neq..(i + 1) * self.neq].copy_from_slice(buf),
            Order::ColMajor => {
                for k in 0..self.neq {
                    y[k * num + i] = buf[k];
                }
            }
        }
    }

    fn run_one<F: OdeSystem>(
        &self,
        f: &F,
        t0: Float,
        t_end: Float,
        p: &[Float],
        y: &mut [Float],
        log: Option<&mut StepRecords>,
    ) -> (ErrorCode, Counters) {
        match self.method {
            Method::Rkf45 => rkf45::integrate(f, t0, t_end, p, y, &self.options, log),
            Method::Radau5 => radau5::integrate(f, t0, t_end, p, y, &self.options, log),
        }
    }

    /// Scalar-per-lane execution: each worker advances one IVP at a time.
    fn run_scalar<F: OdeSystem + Sync>(
        &self,
        f: &F,
        num: usize,
        t0: &[Float],
        t_end: &[Float],
        p: &[Float],
        y: &mut [Float],
    ) -> Vec<IvpResult> {
        let m = p.len() / num;
        let nw = self.num_workers.min(num);
        // Workers read private copies; the calling thread owns the packed
        // buffer and scatters results as they arrive.
        let mut states = Vec::with_capacity(num);
        for i in 0..num {
            let mut buf = vec![0.0; self.neq];
            self.gather(y, num, i, &mut buf);
            states.push(buf);
        }

        let mut results = vec![
            IvpResult {
                code: ErrorCode::Success,
                counters: Counters::default(),
            };
            num
        ];
        let mut batch_logs: Vec<StepRecords> = vec![Vec::new(); num];
        let queue = AtomicUsize::new(0);

        thread::scope(|s| {
            let (tx, rx) = mpsc::channel();
            for w in 0..nw {
                let tx = tx.clone();
                let states = &states;
                let queue = &queue;
                let (lo, hi) = chunk_bounds(num, nw, w);
                s.spawn(move || {
                    let mut next = lo;
                    loop {
                        let i = if self.options.use_queue {
                            queue.fetch_add(1, Ordering::Relaxed)
                        } else {
                            let i = next;
                            next += 1;
                            i
                        };
                        let limit = if self.options.use_queue { num } else { hi };
                        if i >= limit {
                            break;
                        }
                        let mut yl = states[i].clone();
                        let mut records = self.options.logging.then(Vec::new);
                        let (code, counters) = self.run_one(
                            f,
                            t0[i],
                            t_end[i],
                            &p[i * m..(i + 1) * m],
                            &mut yl,
                            records.as_mut(),
                        );
                        if tx.send((i, yl, code, counters, records)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);
            for (i, yl, code, counters, records) in rx {
                self.scatter(&yl, num, i, y);
                results[i] = IvpResult { code, counters };
                if let Some(records) = records {
                    batch_logs[i] = records;
                }
            }
        });

        self.append_logs(batch_logs);
        results
    }

    /// Lock-step execution: groups of `vector_size` IVPs advance together
    /// with masked per-lane commits.
    fn run_lockstep<F: OdeSystem + Sync>(
        &self,
        f: &F,
        num: usize,
        t0: &[Float],
        t_end: &[Float],
        p: &[Float],
        y: &mut [Float],
    ) -> Vec<IvpResult> {
        let m = p.len() / num;
        let vsize = self.options.vector_size;
        let groups = num.div_ceil(vsize);
        let nw = self.num_workers.min(groups);

        let mut states = Vec::with_capacity(num);
        for i in 0..num {
            let mut buf = vec![0.0; self.neq];
            self.gather(y, num, i, &mut buf);
            states.push(buf);
        }

        let mut results = vec![
            IvpResult {
                code: ErrorCode::Success,
                counters: Counters::default(),
            };
            num
        ];
        let mut batch_logs: Vec<StepRecords> = vec![Vec::new(); num];
        let queue = AtomicUsize::new(0);

        thread::scope(|s| {
            let (tx, rx) = mpsc::channel();
            for w in 0..nw {
                let tx = tx.clone();
                let states = &states;
                let queue = &queue;
                let (lo, hi) = chunk_bounds(groups, nw, w);
                s.spawn(move || {
                    let mut next = lo;
                    loop {
                        let g = if self.options.use_queue {
                            queue.fetch_add(1, Ordering::Relaxed)
                        } else {
                            let g = next;
                            next += 1;
                            g
                        };
                        let limit = if self.options.use_queue { groups } else { hi };
                        if g >= limit {
                            break;
                        }

                        // Assemble the group in component-major form,
                        // padding the ragged tail with its last real lane.
                        let base = g * vsize;
                        let active = vsize.min(num - base);
                        let lane_ivp = |l: usize| base + l.min(active - 1);
                        let mut yv = vec![0.0; self.neq * vsize];
                        let mut tv = vec![0.0; vsize];
                        let mut tev = vec![0.0; vsize];
                        let mut pv = vec![0.0; vsize * m];
                        for l in 0..vsize {
                            let i = lane_ivp(l);
                            for k in 0..self.neq {
                                yv[k * vsize + l] = states[i][k];
                            }
                            tv[l] = t0[i];
                            tev[l] = t_end[i];
                            pv[l * m..(l + 1) * m].copy_from_slice(&p[i * m..(i + 1) * m]);
                        }
                        let mut records = self
                            .options
                            .logging
                            .then(|| vec![StepRecords::new(); vsize]);
                        let lane_results = lane::integrate_lockstep(
                            f,
                            vsize,
                            active,
                            self.neq,
                            m,
                            &tv,
                            &tev,
                            &pv,
                            &mut yv,
                            &self.options,
                            records.as_deref_mut(),
                        );
                        if tx.send((g, active, yv, lane_results, records)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);
            for (g, active, yv, lane_results, records) in rx {
                let base = g * vsize;
                for l in 0..active {
                    let i = base + l;
                    let mut buf = vec![0.0; self.neq];
                    for k in 0..self.neq {
                        buf[k] = yv[k * vsize + l];
                    }
                    self.scatter(&buf, num, i, y);
                    let (code, counters) = lane_results[l];
                    results[i] = IvpResult { code, counters };
                }
                if let Some(mut records) = records {
                    for l in 0..active {
                        batch_logs[base + l] = std::mem::take(&mut records[l]);
                    }
                }
            }
        });

        self.append_logs(batch_logs);
        results
    }

    /// Append per-IVP records to the shared log in IVP order, keeping the
    /// log deterministic under any worker scheduling.
    fn append_logs(&self, batch_logs: Vec<StepRecords>) {
        if !self.options.logging {
            return;
        }
        if let Ok(mut log) = self.log.lock() {
            for (ivp, records) in batch_logs.into_iter().enumerate() {
                for (t, y) in records {
                    log.push(LogRecord { ivp, t, y });
                }
            }
        }
    }
}

/// Contiguous index range of worker `w` when `count` tasks are split
/// statically across `nw` workers.
fn chunk_bounds(count: usize, nw: usize, w: usize) -> (usize, usize) {
    let base = count / nw;
    let rem = count % nw;
    let lo = w * base + w.min(rem);
    let hi = lo + base + usize::from(w < rem);
    (lo, hi)
}
