//! Tracer lifecycle: load, attach, adapt, run, stop.
//!
//! State machine: INIT → (offsets proven) STOP → start() → RUNNING ⇄
//! stop() → STOP. INIT → RUNNING is not permitted; until adaptation
//! succeeds the probes are attached solely to feed the offset inference
//! and emit nothing. Attach and detach always run under the probes
//! mutex, which also serializes against the periodic adaptation thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwapOption;
use aya::maps::perf::PerfEventArray;
use aya::maps::{Array, HashMap, MapData, PerCpuArray, PerCpuValues};
use aya::programs::kprobe::KProbeLinkId;
use aya::programs::trace_point::TracePointLinkId;
use aya::programs::{KProbe, TracePoint};
use aya::{Ebpf, EbpfLoader};

use socktrace_ebpf_common::{
    MemberOffsets, SocketInfo, TraceInfo, TraceStats, TraceUid, EVENT_TYPE_MIN,
    MAP_MEMBER_OFFSETS, MAP_RELAY_COMMS, MAP_SOCKET_DATA, MAP_SOCKET_INFO, MAP_TRACE_INFO,
    MAP_TRACE_STATS, MAP_TRACE_UID,
};

use crate::capability;
use crate::config::TracerConfig;
use crate::dispatch::{self, EventRegistry, ReaderCtx};
use crate::error::TracerError;
use crate::record::ProcessEventRecord;
use crate::stats::{QueueCounters, SocketTraceStats, SocketTracerShow, TracerState};
use crate::{offset, reclaim, time, EventHandle, L7Handle};

/// Tracepoint attach points: (category, event). Program names in the
/// object match the event names.
const TRACEPOINTS: &[(&str, &str)] = &[
    ("syscalls", "sys_enter_write"),
    ("syscalls", "sys_exit_write"),
    ("syscalls", "sys_enter_read"),
    ("syscalls", "sys_exit_read"),
    ("syscalls", "sys_enter_sendto"),
    ("syscalls", "sys_exit_sendto"),
    ("syscalls", "sys_enter_recvfrom"),
    ("syscalls", "sys_exit_recvfrom"),
    ("syscalls", "sys_exit_sendmsg"),
    ("syscalls", "sys_exit_sendmmsg"),
    ("syscalls", "sys_exit_recvmsg"),
    ("syscalls", "sys_exit_recvmmsg"),
    ("syscalls", "sys_exit_writev"),
    ("syscalls", "sys_exit_readv"),
    ("syscalls", "sys_enter_close"),
    ("syscalls", "sys_enter_getppid"),
    ("syscalls", "sys_exit_socket"),
    ("sched", "sched_process_exec"),
    ("sched", "sched_process_exit"),
];

/// Kernel functions probed for the msg/mmsg/vec variants; their argument
/// layout is steadier than the tracepoint form on older kernels.
const KPROBES: &[&str] = &[
    "__sys_sendmsg",
    "__sys_sendmmsg",
    "__sys_recvmsg",
    "__sys_recvmmsg",
    "do_writev",
    "do_readv",
];

pub(crate) const PROBES_COUNT: u32 = (TRACEPOINTS.len() + KPROBES.len()) as u32;

enum ProbeLink {
    Tp { name: &'static str, id: TracePointLinkId },
    Kp { name: &'static str, id: KProbeLinkId },
}

pub(crate) struct Probes {
    ebpf: Ebpf,
    links: Vec<ProbeLink>,
}

fn tracepoint_mut<'a>(ebpf: &'a mut Ebpf, name: &str) -> Result<&'a mut TracePoint, TracerError> {
    let prog = ebpf.program_mut(name).ok_or_else(|| TracerError::Program {
        name: name.into(),
        reason: "not found in object".into(),
    })?;
    prog.try_into().map_err(|e: aya::programs::ProgramError| TracerError::Program {
        name: name.into(),
        reason: e.to_string(),
    })
}

fn kprobe_mut<'a>(ebpf: &'a mut Ebpf, name: &str) -> Result<&'a mut KProbe, TracerError> {
    let prog = ebpf.program_mut(name).ok_or_else(|| TracerError::Program {
        name: name.into(),
        reason: "not found in object".into(),
    })?;
    prog.try_into().map_err(|e: aya::programs::ProgramError| TracerError::Program {
        name: name.into(),
        reason: e.to_string(),
    })
}

fn load_programs(ebpf: &mut Ebpf) -> Result<(), TracerError> {
    for (_, name) in TRACEPOINTS {
        tracepoint_mut(ebpf, name)?
            .load()
            .map_err(|e| TracerError::Program {
                name: (*name).into(),
                reason: e.to_string(),
            })?;
    }
    for name in KPROBES {
        kprobe_mut(ebpf, name)?
            .load()
            .map_err(|e| TracerError::Program {
                name: (*name).into(),
                reason: e.to_string(),
            })?;
    }
    Ok(())
}

pub(crate) fn attach_probes(probes: &mut Probes) -> Result<(), TracerError> {
    if !probes.links.is_empty() {
        return Ok(());
    }
    for (category, name) in TRACEPOINTS {
        let id = tracepoint_mut(&mut probes.ebpf, name)?
            .attach(category, name)
            .map_err(|e| TracerError::Program {
                name: (*name).into(),
                reason: e.to_string(),
            })?;
        probes.links.push(ProbeLink::Tp { name, id });
    }
    for name in KPROBES {
        let id = kprobe_mut(&mut probes.ebpf, name)?
            .attach(name, 0)
            .map_err(|e| TracerError::Program {
                name: (*name).into(),
                reason: e.to_string(),
            })?;
        probes.links.push(ProbeLink::Kp { name, id });
    }
    log::debug!("attached {} probes", probes.links.len());
    Ok(())
}

pub(crate) fn detach_probes(probes: &mut Probes) -> Result<(), TracerError> {
    while let Some(link) = probes.links.pop() {
        match link {
            ProbeLink::Tp { name, id } => {
                tracepoint_mut(&mut probes.ebpf, name)?
                    .detach(id)
                    .map_err(|e| TracerError::Program {
                        name: name.into(),
                        reason: e.to_string(),
                    })?;
            }
            ProbeLink::Kp { name, id } => {
                kprobe_mut(&mut probes.ebpf, name)?
                    .detach(id)
                    .map_err(|e| TracerError::Program {
                        name: name.into(),
                        reason: e.to_string(),
                    })?;
            }
        }
    }
    log::debug!("all probes detached");
    Ok(())
}

/// State shared between the public handle and the background threads.
pub(crate) struct Inner {
    pub(crate) config: TracerConfig,
    pub(crate) kernel_version: (u32, u32),
    pub(crate) nr_cpus: usize,
    pub(crate) state: Mutex<TracerState>,
    pub(crate) probes: Mutex<Probes>,
    pub(crate) adapt_success: AtomicBool,
    pub(crate) shutdown: Arc<AtomicBool>,
    pub(crate) kern_lost: Arc<AtomicU64>,
    pub(crate) boot_time_ns: Arc<AtomicU64>,
    pub(crate) prev_boot_time_ns: AtomicU64,
    pub(crate) queue_counters: Vec<Arc<QueueCounters>>,
    pub(crate) socket_map: Mutex<HashMap<MapData, u64, SocketInfo>>,
    pub(crate) trace_map: Mutex<HashMap<MapData, u64, TraceInfo>>,
    pub(crate) stats_map: Mutex<PerCpuArray<MapData, TraceStats>>,
    pub(crate) offsets_map: Mutex<PerCpuArray<MapData, MemberOffsets>>,
    pub(crate) proven_offsets: ArcSwapOption<MemberOffsets>,
    pub(crate) socket_reclaim_count: AtomicU64,
    pub(crate) trace_reclaim_count: AtomicU64,
    pub(crate) events: EventRegistry,
}

struct Threads {
    reader: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    periodic: Option<JoinHandle<()>>,
    proc_events: Option<JoinHandle<()>>,
    offset_probe: Vec<JoinHandle<()>>,
}

/// The socket tracer. Constructed by [`SocketTracer::run`]; dropping it
/// shuts down every background thread and unloads the programs.
pub struct SocketTracer {
    inner: Arc<Inner>,
    threads: Mutex<Threads>,
}

fn take_map(ebpf: &mut Ebpf, name: &str) -> Result<aya::maps::Map, TracerError> {
    ebpf.take_map(name).ok_or_else(|| TracerError::Map {
        name: name.into(),
        reason: "not found in object".into(),
    })
}

fn map_err(name: &str) -> impl Fn(aya::maps::MapError) -> TracerError + '_ {
    move |e| TracerError::Map {
        name: name.into(),
        reason: e.to_string(),
    }
}

fn comm_bytes(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    let n = name.len().min(15);
    out[..n].copy_from_slice(&name.as_bytes()[..n]);
    out
}

impl SocketTracer {
    /// One-shot bring-up: load the kernel object, seed the config maps,
    /// spawn the user plane, attach probes for offset inference, and
    /// return in INIT. The periodic thread moves the tracer to STOP once
    /// adaptation succeeds; `start()` takes it to RUNNING from there.
    pub fn run(config: TracerConfig, handle: L7Handle) -> Result<SocketTracer, TracerError> {
        config.validate()?;
        let kernel_version = capability::check_kernel_version()?;
        log::info!(
            "socket tracer starting on Linux {}.{} (btf={})",
            kernel_version.0,
            kernel_version.1,
            capability::btf_present()
        );

        let nr_cpus =
            aya::util::nr_cpus().map_err(|e| TracerError::Load(format!("nr_cpus: {e:?}")))?;
        let cpus = aya::util::online_cpus()
            .map_err(|e| TracerError::Load(format!("online cpus: {e:?}")))?;

        let mut loader = EbpfLoader::new();
        loader.set_max_entries(MAP_SOCKET_INFO, config.max_socket_entries);
        loader.set_max_entries(MAP_TRACE_INFO, config.max_trace_entries);
        let mut ebpf = loader
            .load_file(&config.bpf_object)
            .map_err(|e| TracerError::Load(format!("{}: {e}", config.bpf_object.display())))?;

        load_programs(&mut ebpf)?;

        // Seed the per-CPU id allocators: (cpu << 56) | (epoch_ns / 100).
        let epoch_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| TracerError::Load(format!("system clock: {e}")))?
            .as_nanos() as u64;
        let uid_base = (epoch_ns / 100) & 0x00ff_ffff_ffff_ffff;
        if uid_base == 0 {
            return Err(TracerError::Load("uid base computed as zero".into()));
        }
        let mut trace_uid: PerCpuArray<_, TraceUid> =
            PerCpuArray::try_from(take_map(&mut ebpf, MAP_TRACE_UID)?)
                .map_err(map_err(MAP_TRACE_UID))?;
        let seeds: Vec<TraceUid> = (0..nr_cpus)
            .map(|cpu| TraceUid {
                socket_id: (cpu as u64) << 56 | uid_base,
                thread_trace_id: (cpu as u64) << 56 | uid_base,
            })
            .collect();
        trace_uid
            .set(
                0,
                PerCpuValues::try_from(seeds).map_err(|e| TracerError::Map {
                    name: MAP_TRACE_UID.into(),
                    reason: e.to_string(),
                })?,
                0,
            )
            .map_err(map_err(MAP_TRACE_UID))?;

        // Relay process names for the peer-fd tracing hook.
        let mut relay: Array<_, [u8; 16]> =
            Array::try_from(take_map(&mut ebpf, MAP_RELAY_COMMS)?)
                .map_err(map_err(MAP_RELAY_COMMS))?;
        for (i, name) in config.relay_comms.iter().enumerate() {
            relay
                .set(i as u32, comm_bytes(name), 0)
                .map_err(map_err(MAP_RELAY_COMMS))?;
        }

        let socket_map = HashMap::try_from(take_map(&mut ebpf, MAP_SOCKET_INFO)?)
            .map_err(map_err(MAP_SOCKET_INFO))?;
        let trace_map = HashMap::try_from(take_map(&mut ebpf, MAP_TRACE_INFO)?)
            .map_err(map_err(MAP_TRACE_INFO))?;
        let stats_map = PerCpuArray::try_from(take_map(&mut ebpf, MAP_TRACE_STATS)?)
            .map_err(map_err(MAP_TRACE_STATS))?;
        let offsets_map = PerCpuArray::try_from(take_map(&mut ebpf, MAP_MEMBER_OFFSETS)?)
            .map_err(map_err(MAP_MEMBER_OFFSETS))?;
        let perf = PerfEventArray::try_from(take_map(&mut ebpf, MAP_SOCKET_DATA)?)
            .map_err(map_err(MAP_SOCKET_DATA))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let kern_lost = Arc::new(AtomicU64::new(0));
        let boot_time_ns = Arc::new(AtomicU64::new(time::boot_time_ns()));
        let events: EventRegistry = Arc::new(RwLock::new(Vec::new()));
        let queue_counters: Vec<Arc<QueueCounters>> = (0..config.thread_nr)
            .map(|_| Arc::new(QueueCounters::default()))
            .collect();

        let (senders, workers) = dispatch::spawn_workers(
            config.thread_nr,
            config.queue_size as usize,
            handle,
            &queue_counters,
            shutdown.clone(),
        )?;

        let (proc_tx, proc_rx) = crossbeam_channel::bounded::<ProcessEventRecord>(1024);
        let proc_events = dispatch::spawn_process_events(proc_rx, shutdown.clone())?;

        let reader = dispatch::spawn_reader(ReaderCtx {
            perf,
            perf_pages: config.perf_pages_cnt as usize,
            cpus: cpus.clone(),
            boot_time_ns: boot_time_ns.clone(),
            kern_lost: kern_lost.clone(),
            senders,
            counters: queue_counters.clone(),
            events: events.clone(),
            proc_tx,
            shutdown: shutdown.clone(),
        })?;

        let inner = Arc::new(Inner {
            config,
            kernel_version,
            nr_cpus,
            state: Mutex::new(TracerState::Init),
            probes: Mutex::new(Probes {
                ebpf,
                links: Vec::new(),
            }),
            adapt_success: AtomicBool::new(false),
            shutdown: shutdown.clone(),
            kern_lost,
            boot_time_ns,
            prev_boot_time_ns: AtomicU64::new(0),
            queue_counters,
            socket_map: Mutex::new(socket_map),
            trace_map: Mutex::new(trace_map),
            stats_map: Mutex::new(stats_map),
            offsets_map: Mutex::new(offsets_map),
            proven_offsets: ArcSwapOption::empty(),
            socket_reclaim_count: AtomicU64::new(0),
            trace_reclaim_count: AtomicU64::new(0),
            events,
        });

        // Attach in INIT: the probes stay silent until offsets are
        // proven, but the inference walk needs them live.
        attach_probes(&mut inner.probes.lock().unwrap_or_else(|e| e.into_inner()))?;

        let offset_probe = offset::spawn_loopback_probe(&cpus, shutdown)?;
        let periodic = reclaim::spawn_periodic(inner.clone())?;

        Ok(SocketTracer {
            inner,
            threads: Mutex::new(Threads {
                reader: Some(reader),
                workers,
                periodic: Some(periodic),
                proc_events: Some(proc_events),
                offset_probe,
            }),
        })
    }

    /// Attach probes and start delivering events. Idempotent from
    /// RUNNING; not permitted from INIT (adaptation has not finished).
    pub fn start(&self) -> Result<(), TracerError> {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            TracerState::Init => Err(TracerError::InvalidState(
                "start from INIT: kernel adaptation has not completed",
            )),
            TracerState::Running => {
                log::warn!("tracer already RUNNING");
                Ok(())
            }
            TracerState::Stop => {
                let mut probes = self.inner.probes.lock().unwrap_or_else(|e| e.into_inner());
                attach_probes(&mut probes)?;
                *state = TracerState::Running;
                log::info!("tracer started, state RUNNING");
                Ok(())
            }
        }
    }

    /// Detach probes and stop delivering events. In-flight buffers drain
    /// naturally; the socket map is cleared. Idempotent from STOP; not
    /// permitted from INIT.
    pub fn stop(&self) -> Result<(), TracerError> {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            TracerState::Init => Err(TracerError::InvalidState(
                "stop from INIT: kernel adaptation has not completed",
            )),
            TracerState::Stop => {
                log::warn!("tracer already STOP");
                Ok(())
            }
            TracerState::Running => {
                let mut probes = self.inner.probes.lock().unwrap_or_else(|e| e.into_inner());
                detach_probes(&mut probes)?;
                *state = TracerState::Stop;
                drop(probes);
                drop(state);
                reclaim::reclaim_socket_map(&self.inner, 0);
                log::info!("tracer stopped, state STOP");
                Ok(())
            }
        }
    }

    /// Register a callback for extra events (`event_type >= EVENT_TYPE_MIN`).
    /// Matching is by bit intersection with the registered mask.
    pub fn register_event_handle(
        &self,
        event_type: u32,
        handle: EventHandle,
    ) -> Result<(), TracerError> {
        if event_type < EVENT_TYPE_MIN {
            return Err(TracerError::Config(format!(
                "event type {event_type:#x} is below the extra-event range"
            )));
        }
        self.inner
            .events
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((event_type, handle));
        Ok(())
    }

    pub fn state(&self) -> TracerState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_adapt_success(&self) -> bool {
        self.inner.adapt_success.load(Ordering::Relaxed)
    }

    /// Counter snapshot across the kernel maps and the user plane.
    pub fn stats(&self) -> SocketTraceStats {
        let inner = &self.inner;
        let totals = reclaim::collect_trace_stats(inner);
        let socket_reclaims = inner.socket_reclaim_count.load(Ordering::Relaxed);
        let trace_reclaims = inner.trace_reclaim_count.load(Ordering::Relaxed);

        let mut enqueue = 0u64;
        let mut dequeue = 0u64;
        let mut lost = 0u64;
        let mut bursts = 0u64;
        let mut alloc_fail = 0u64;
        for q in &inner.queue_counters {
            enqueue += q.enqueue_nr.load(Ordering::Relaxed);
            dequeue += q.dequeue_nr.load(Ordering::Relaxed);
            lost += q.enqueue_lost.load(Ordering::Relaxed);
            bursts += q.burst_count.load(Ordering::Relaxed);
            alloc_fail += q.alloc_fail.load(Ordering::Relaxed);
        }

        let boot = inner.boot_time_ns.load(Ordering::Relaxed);
        let prev = inner.prev_boot_time_ns.load(Ordering::Relaxed);
        let boot_diff = if prev == 0 { 0 } else { boot as i64 - prev as i64 };

        SocketTraceStats {
            kern_lost: inner.kern_lost.load(Ordering::Relaxed),
            worker_num: inner.config.thread_nr as u32,
            perf_pages_cnt: inner.config.perf_pages_cnt,
            queue_capacity: inner.config.queue_size,
            kern_socket_map_max: inner.config.max_socket_entries,
            kern_trace_map_max: inner.config.max_trace_entries,
            socket_map_max_reclaim: inner.config.socket_map_max_reclaim,
            kern_socket_map_used: totals.socket_map_count - socket_reclaims as i64,
            kern_trace_map_used: totals.trace_map_count - trace_reclaims as i64,
            kern_socket_map_drops: totals.socket_map_drops,
            kern_trace_map_drops: totals.trace_map_drops,
            user_enqueue_count: enqueue,
            user_dequeue_count: dequeue,
            user_enqueue_lost: lost,
            queue_burst_count: bursts,
            mem_alloc_fail_count: alloc_fail,
            socket_map_reclaim_count: socket_reclaims,
            trace_map_reclaim_count: trace_reclaims,
            probes_count: PROBES_COUNT,
            is_adapt_success: inner.adapt_success.load(Ordering::Relaxed),
            tracer_state: self.state(),
            boot_time_update_diff: boot_diff,
        }
    }

    /// Stats plus the per-CPU offset parameters (the diagnostic "show"
    /// surface).
    pub fn show(&self) -> Result<SocketTracerShow, TracerError> {
        let offsets = {
            let map = self
                .inner
                .offsets_map
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            offset::collect_offsets(&map)?
        };
        Ok(SocketTracerShow {
            stats: self.stats(),
            offsets,
        })
    }

    /// Kernel version the capability check saw at startup.
    pub fn kernel_version(&self) -> (u32, u32) {
        self.inner.kernel_version
    }

    /// The offset set proven by adaptation, once one exists.
    pub fn proven_offsets(&self) -> Option<MemberOffsets> {
        self.inner.proven_offsets.load_full().map(|o| *o)
    }
}

impl Drop for SocketTracer {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        for h in threads.offset_probe.drain(..) {
            let _ = h.join();
        }
        if let Some(h) = threads.reader.take() {
            let _ = h.join();
        }
        for h in threads.workers.drain(..) {
            let _ = h.join();
        }
        if let Some(h) = threads.periodic.take() {
            let _ = h.join();
        }
        if let Some(h) = threads.proc_events.take() {
            let _ = h.join();
        }
    }
}
