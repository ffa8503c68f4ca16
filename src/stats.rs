//! # Contadores de Eventos do Alocador
//!
//! Eventos globais de alocação e reclaim, no estilo dos contadores de VM do
//! kernel. Não são telemetria opcional: `allocstall`/`pageoutrun` e os pares
//! scan/steal alimentam diagnóstico de pressão, e os testes usam o snapshot
//! para verificar os caminhos percorridos.

use core::sync::atomic::{AtomicU64, Ordering};

/// Contadores de eventos de VM, um bloco por `SystemMemory`.
///
/// Alinhado a linha de cache para não dividir linha com os locks vizinhos.
#[repr(C, align(64))]
pub struct VmEvents {
    /// Páginas alocadas (todas as ordens, contadas em páginas)
    pub pgalloc: AtomicU64,
    /// Páginas devolvidas ao buddy
    pub pgfree: AtomicU64,
    /// Alocações que caíram no slow path
    pub pgalloc_slowpath: AtomicU64,
    /// Alocações servidas por tipo de migração de fallback
    pub pgfallback: AtomicU64,
    /// Pageblocks inteiros reivindicados pelo tipo de fallback
    pub pgblock_claims: AtomicU64,

    /// Páginas movidas inactive -> active
    pub pgactivate: AtomicU64,
    /// Páginas movidas active -> inactive
    pub pgdeactivate: AtomicU64,
    /// Páginas giradas de volta ao topo da própria lista
    pub pgrotated: AtomicU64,

    /// Páginas examinadas pelo kswapd
    pub pgscan_kswapd: AtomicU64,
    /// Páginas examinadas por reclaim direto
    pub pgscan_direct: AtomicU64,
    /// Páginas liberadas pelo kswapd
    pub pgsteal_kswapd: AtomicU64,
    /// Páginas liberadas por reclaim direto
    pub pgsteal_direct: AtomicU64,
    /// Writebacks iniciados pelo reclaim
    pub pageout: AtomicU64,

    /// Entradas em reclaim direto
    pub allocstall: AtomicU64,
    /// Episódios de balanceamento do kswapd
    pub pageoutrun: AtomicU64,
    /// Despertares do kswapd
    pub kswapd_wakeups: AtomicU64,
    /// Esperas no throttle PFMEMALLOC
    pub pfmemalloc_throttled: AtomicU64,

    /// Vítimas mortas pelo OOM killer
    pub oom_kills: AtomicU64,

    /// Refills do cache per-CPU a partir do buddy
    pub pcp_refills: AtomicU64,
    /// Drenos do cache per-CPU de volta ao buddy
    pub pcp_drains: AtomicU64,

    /// Objetos de shrinker examinados
    pub slabs_scanned: AtomicU64,
}

impl VmEvents {
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            pgalloc: ZERO,
            pgfree: ZERO,
            pgalloc_slowpath: ZERO,
            pgfallback: ZERO,
            pgblock_claims: ZERO,
            pgactivate: ZERO,
            pgdeactivate: ZERO,
            pgrotated: ZERO,
            pgscan_kswapd: ZERO,
            pgscan_direct: ZERO,
            pgsteal_kswapd: ZERO,
            pgsteal_direct: ZERO,
            pageout: ZERO,
            allocstall: ZERO,
            pageoutrun: ZERO,
            kswapd_wakeups: ZERO,
            pfmemalloc_throttled: ZERO,
            oom_kills: ZERO,
            pcp_refills: ZERO,
            pcp_drains: ZERO,
            slabs_scanned: ZERO,
        }
    }

    /// Tira um snapshot consistente-o-suficiente (leituras relaxed).
    pub fn snapshot(&self) -> VmEventsSnapshot {
        VmEventsSnapshot {
            pgalloc: self.pgalloc.load(Ordering::Relaxed),
            pgfree: self.pgfree.load(Ordering::Relaxed),
            pgalloc_slowpath: self.pgalloc_slowpath.load(Ordering::Relaxed),
            pgfallback: self.pgfallback.load(Ordering::Relaxed),
            pgblock_claims: self.pgblock_claims.load(Ordering::Relaxed),
            pgactivate: self.pgactivate.load(Ordering::Relaxed),
            pgdeactivate: self.pgdeactivate.load(Ordering::Relaxed),
            pgrotated: self.pgrotated.load(Ordering::Relaxed),
            pgscan_kswapd: self.pgscan_kswapd.load(Ordering::Relaxed),
            pgscan_direct: self.pgscan_direct.load(Ordering::Relaxed),
            pgsteal_kswapd: self.pgsteal_kswapd.load(Ordering::Relaxed),
            pgsteal_direct: self.pgsteal_direct.load(Ordering::Relaxed),
            pageout: self.pageout.load(Ordering::Relaxed),
            allocstall: self.allocstall.load(Ordering::Relaxed),
            pageoutrun: self.pageoutrun.load(Ordering::Relaxed),
            kswapd_wakeups: self.kswapd_wakeups.load(Ordering::Relaxed),
            pfmemalloc_throttled: self.pfmemalloc_throttled.load(Ordering::Relaxed),
            oom_kills: self.oom_kills.load(Ordering::Relaxed),
            pcp_refills: self.pcp_refills.load(Ordering::Relaxed),
            pcp_drains: self.pcp_drains.load(Ordering::Relaxed),
            slabs_scanned: self.slabs_scanned.load(Ordering::Relaxed),
        }
    }

    /// Imprime resumo dos eventos via log.
    pub fn report(&self) {
        let s = self.snapshot();
        crate::kinfo!(
            "(STATS) alloc={} free={} slowpath={} fallback={} claims={}",
            s.pgalloc,
            s.pgfree,
            s.pgalloc_slowpath,
            s.pgfallback,
            s.pgblock_claims
        );
        crate::kinfo!(
            "(STATS) scan k/d={}/{} steal k/d={}/{} pageout={} rotate={}",
            s.pgscan_kswapd,
            s.pgscan_direct,
            s.pgsteal_kswapd,
            s.pgsteal_direct,
            s.pageout,
            s.pgrotated
        );
        crate::kinfo!(
            "(STATS) allocstall={} pageoutrun={} wakeups={} throttled={} oom={}",
            s.allocstall,
            s.pageoutrun,
            s.kswapd_wakeups,
            s.pfmemalloc_throttled,
            s.oom_kills
        );
    }
}

impl Default for VmEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot plano dos contadores, para testes e relatórios.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmEventsSnapshot {
    pub pgalloc: u64,
    pub pgfree: u64,
    pub pgalloc_slowpath: u64,
    pub pgfallback: u64,
    pub pgblock_claims: u64,
    pub pgactivate: u64,
    pub pgdeactivate: u64,
    pub pgrotated: u64,
    pub pgscan_kswapd: u64,
    pub pgscan_direct: u64,
    pub pgsteal_kswapd: u64,
    pub pgsteal_direct: u64,
    pub pageout: u64,
    pub allocstall: u64,
    pub pageoutrun: u64,
    pub kswapd_wakeups: u64,
    pub pfmemalloc_throttled: u64,
    pub oom_kills: u64,
    pub pcp_refills: u64,
    pub pcp_drains: u64,
    pub slabs_scanned: u64,
}

impl VmEventsSnapshot {
    /// Total de páginas examinadas por qualquer reclaimer.
    pub fn total_scanned(&self) -> u64 {
        self.pgscan_kswapd + self.pgscan_direct
    }

    /// Total de páginas liberadas por qualquer reclaimer.
    pub fn total_reclaimed(&self) -> u64 {
        self.pgsteal_kswapd + self.pgsteal_direct
    }
}
