//! This module records statistics about adapter generation and linking. "Durations" are
//! wall-clock time, so they inevitably fail to account for context switches and the like: treat
//! them as a best effort.

use parking_lot::Mutex;
#[cfg(not(test))]
use std::env;
use std::{
    cell::Cell,
    fs,
    ops::DerefMut,
    time::{Duration, Instant},
};
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

/// Record statistics if enabled. In non-testing mode, this is only enabled if the end user
/// defines the environment variable `CVA_LOG_STATS`. In testing mode, this is always enabled,
/// with output being sent to `stderr`.
pub(crate) struct Stats {
    // Most runs won't record statistics, so the check for "are any stats to be recorded?" is a
    // simple `None` test: only if stats are to be recorded do we have to lock a `Mutex`.
    inner: Option<Mutex<StatsInner>>,
}

struct StatsInner {
    /// The path to write output. If exactly equal to `-`, output will be written to stderr.
    output_path: String,
    /// How many adapters were generated? This includes adapters discarded after losing a race
    /// to be published.
    adapters_generated: u64,
    /// How many adapter lookups found an already published adapter?
    adapter_cache_hits: u64,
    /// How many adapters were copied into executable memory?
    adapters_installed: u64,
    /// How many method entry points were linked to an adapter?
    call_sites_linked: u64,
    /// How many live call or jump sites were repointed?
    call_sites_patched: u64,
    /// How many methods were forwarded to a replacement?
    methods_forwarded: u64,
    /// The time spent in each [TimingState].
    durations: [Duration; TimingState::COUNT],
}

impl Stats {
    #[cfg(not(test))]
    pub fn new() -> Self {
        if let Ok(p) = env::var("CVA_LOG_STATS") {
            Self {
                inner: Some(Mutex::new(StatsInner::new(p))),
            }
        } else {
            Self { inner: None }
        }
    }

    #[cfg(test)]
    pub fn new() -> Self {
        Self {
            inner: Some(Mutex::new(StatsInner::new("-".to_string()))),
        }
    }

    /// If `CVA_LOG_STATS` was specified, update `inner` by running the function `f`, otherwise
    /// return immediately without calling `f`.
    fn update_with<F>(&self, f: F)
    where
        F: FnOnce(&mut StatsInner),
    {
        if let Some(mtx) = &self.inner {
            f(mtx.lock().deref_mut());
        }
    }

    pub fn adapter_generated(&self) {
        self.update_with(|inner| inner.adapters_generated += 1);
    }

    pub fn adapter_cache_hit(&self) {
        self.update_with(|inner| inner.adapter_cache_hits += 1);
    }

    pub fn adapter_installed(&self) {
        self.update_with(|inner| inner.adapters_installed += 1);
    }

    pub fn call_site_linked(&self) {
        self.update_with(|inner| inner.call_sites_linked += 1);
    }

    pub fn call_site_patched(&self) {
        self.update_with(|inner| inner.call_sites_patched += 1);
    }

    pub fn method_forwarded(&self) {
        self.update_with(|inner| inner.methods_forwarded += 1);
    }

    /// Change the [TimingState] the current thread is in.
    pub fn timing_state(&self, new_state: TimingState) {
        self.update_with(|inner| {
            let now = Instant::now();
            let (prev_state, then) = THREAD_STATE.replace((new_state, now));
            let d = now.saturating_duration_since(then);
            inner.durations[prev_state as usize] =
                inner.durations[prev_state as usize].saturating_add(d);
        });
    }

    /// Output these statistics to the appropriate output path.
    pub(crate) fn output(&self) {
        self.update_with(|inner| inner.output());
    }

    #[cfg(test)]
    pub(crate) fn to_json(&self) -> String {
        self.inner.as_ref().unwrap().lock().to_json()
    }
}

impl StatsInner {
    fn new(output_path: String) -> Self {
        Self {
            output_path,
            adapters_generated: 0,
            adapter_cache_hits: 0,
            adapters_installed: 0,
            call_sites_linked: 0,
            call_sites_patched: 0,
            methods_forwarded: 0,
            durations: [Duration::new(0, 0); TimingState::COUNT],
        }
    }

    /// Output these statistics to the appropriate output path.
    fn output(&self) {
        let json = self.to_json();
        if self.output_path == "-" {
            eprintln!("{json}");
        } else {
            fs::write(&self.output_path, json).ok();
        }
    }

    /// Turn these statistics into JSON. The output is guaranteed to be sorted by field name so
    /// that textual matching of the JSON string is possible.
    fn to_json(&self) -> String {
        fn fmt_duration(d: Duration) -> String {
            format!("{}.{:03}", d.as_secs(), d.subsec_millis())
        }

        let mut fields = vec![
            (
                "adapters_generated".to_owned(),
                self.adapters_generated.to_string(),
            ),
            (
                "adapter_cache_hits".to_owned(),
                self.adapter_cache_hits.to_string(),
            ),
            (
                "adapters_installed".to_owned(),
                self.adapters_installed.to_string(),
            ),
            (
                "call_sites_linked".to_owned(),
                self.call_sites_linked.to_string(),
            ),
            (
                "call_sites_patched".to_owned(),
                self.call_sites_patched.to_string(),
            ),
            (
                "methods_forwarded".to_owned(),
                self.methods_forwarded.to_string(),
            ),
        ];
        for v in TimingState::iter() {
            let s = v.to_string();
            if !s.is_empty() {
                fields.push((s, fmt_duration(self.durations[v as usize])));
            }
        }
        fields.sort_unstable_by(|(k1, _), (k2, _)| k1.cmp(k2));
        format!(
            r#"{{
    {}
}}"#,
            fields
                .iter()
                .map(|(x, y)| format!(r#""{x}": {y}"#))
                .collect::<Vec<_>>()
                .join(",\n    ")
        )
    }
}

/// The different timing states a thread can go through.
#[repr(u8)]
#[derive(Copy, Clone, Display, EnumCount, EnumIter)]
// New states must keep the variants in `0..TimingState::COUNT` (i.e. don't assign numbers with
// `= <int>`), and have a `strum` `to_string` naming their key in the JSON stats. States whose
// `to_string` is empty are not output.
pub(crate) enum TimingState {
    /// The "we don't know what this thread is doing" state. Time spent in this state is not
    /// counted towards anything and is not displayed to the user.
    #[strum(to_string = "")]
    None,
    /// This thread is generating an adapter.
    #[strum(to_string = "duration_generating")]
    Generating,
    /// This thread is installing and linking code.
    #[strum(to_string = "duration_installing")]
    Installing,
}

thread_local! {
    static THREAD_STATE: Cell<(TimingState, Instant)> = Cell::new((TimingState::None, Instant::now()));
}
