//! # Zonas de Memória Física
//!
//! A memória física é particionada em zonas por restrição de DMA e de
//! mapeamento (DMA, DMA32, Normal, Movable). Cada zona carrega seu
//! próprio buddy, seus caches per-CPU, suas listas LRU e suas marcas
//! d'água. Dois locks distintos guardam o estado: o lock do buddy
//! (áreas livres) e o lock de LRU. Eles nunca são aninhados.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use spin::Mutex;

use crate::buddy::FreeAreas;
use crate::config::{align_down, align_up, MAX_CPUS, PAGEBLOCK_ORDER, PAGEBLOCK_PAGES};
use crate::migrate::MigrateType;
use crate::pcp::PerCpuPages;
use crate::reclaim::lru::{LruKind, LruSet, LRU_KIND_COUNT};

// =============================================================================
// TIPOS BÁSICOS
// =============================================================================

/// Classes de zona, da mais restrita para a mais ampla.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ZoneKind {
    /// Endereçável por dispositivos legados (ISA, < 16 MiB)
    Dma = 0,
    /// Endereçável por DMA de 32 bits (< 4 GiB)
    Dma32 = 1,
    /// Memória normal, sempre mapeada pelo kernel
    Normal = 2,
    /// Memória alta/realocável, só para dados de usuário
    Movable = 3,
}

/// Número de classes de zona.
pub const ZONE_KIND_COUNT: usize = 4;

impl ZoneKind {
    pub const ALL: [ZoneKind; ZONE_KIND_COUNT] =
        [ZoneKind::Dma, ZoneKind::Dma32, ZoneKind::Normal, ZoneKind::Movable];

    pub const fn as_usize(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            ZoneKind::Dma => "DMA",
            ZoneKind::Dma32 => "DMA32",
            ZoneKind::Normal => "Normal",
            ZoneKind::Movable => "Movable",
        }
    }

    pub fn from_usize(idx: usize) -> Option<ZoneKind> {
        Self::ALL.get(idx).copied()
    }
}

/// Níveis de marca d'água de páginas livres.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum WatermarkLevel {
    /// Piso de emergência; abaixo dele só MEMALLOC passa
    Min = 0,
    /// Acorda o kswapd quando cruzada para baixo
    Low = 1,
    /// Alvo do kswapd; acima dela a zona está balanceada
    High = 2,
}

/// Faixa de PFNs coberta por uma zona (fim exclusivo).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PfnRange {
    pub start: usize,
    pub end: usize,
}

impl PfnRange {
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    pub const fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub const fn contains(&self, pfn: usize) -> bool {
        pfn >= self.start && pfn < self.end
    }
}

// =============================================================================
// FLAGS DE ZONA
// =============================================================================

/// O scan varreu 6x as páginas recuperáveis sem liberar nada; a zona
/// fica fora das contas de balanceamento até alguém liberar páginas.
pub const ZONE_ALL_UNRECLAIMABLE: u32 = 1 << 0;

/// Writeback acumulado na cauda da inativa. `wait_iff_congested` dorme
/// enquanto isto estiver em pé; o kswapd derruba quando a zona volta à
/// marca alta.
pub const ZONE_CONGESTED: u32 = 1 << 1;

/// Flags de estado da zona, mutáveis sem lock.
pub struct ZoneFlags(AtomicU32);

impl ZoneFlags {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn test(&self, flag: u32) -> bool {
        self.0.load(Ordering::Acquire) & flag != 0
    }

    pub fn set(&self, flag: u32) {
        self.0.fetch_or(flag, Ordering::AcqRel);
    }

    pub fn clear(&self, flag: u32) {
        self.0.fetch_and(!flag, Ordering::AcqRel);
    }
}

// =============================================================================
// CONTADORES DE ZONA
// =============================================================================

/// Contadores de estado da zona, isolados em sua própria linha de cache.
///
/// `free_pages` é um espelho do total mantido sob o lock do buddy, para
/// leituras sem lock nos testes de marca d'água.
#[repr(C, align(64))]
pub struct ZoneCounters {
    pub free_pages: AtomicUsize,
    pub lru: [AtomicUsize; LRU_KIND_COUNT],
    pub isolated_anon: AtomicUsize,
    pub isolated_file: AtomicUsize,
    pub writeback: AtomicUsize,
    pub dirty: AtomicUsize,
    /// Páginas examinadas desde a última liberação; alimenta o
    /// veredito de all_unreclaimable.
    pub pages_scanned: AtomicUsize,
}

impl ZoneCounters {
    pub const fn new() -> Self {
        const ZERO: AtomicUsize = AtomicUsize::new(0);
        Self {
            free_pages: ZERO,
            lru: [ZERO; LRU_KIND_COUNT],
            isolated_anon: ZERO,
            isolated_file: ZERO,
            writeback: ZERO,
            dirty: ZERO,
            pages_scanned: ZERO,
        }
    }

    pub fn lru_count(&self, kind: LruKind) -> usize {
        self.lru[kind.as_usize()].load(Ordering::Relaxed)
    }

    pub fn lru_add(&self, kind: LruKind, n: usize) {
        self.lru[kind.as_usize()].fetch_add(n, Ordering::Relaxed);
    }

    pub fn lru_sub(&self, kind: LruKind, n: usize) {
        self.lru[kind.as_usize()].fetch_sub(n, Ordering::Relaxed);
    }
}

/// Retrato de uma zona para relatórios.
#[derive(Debug, Clone, Copy)]
pub struct ZoneUsage {
    pub kind: ZoneKind,
    pub spanned: usize,
    pub managed: usize,
    pub free: usize,
    pub wmark_min: usize,
    pub wmark_low: usize,
    pub wmark_high: usize,
    pub active_anon: usize,
    pub inactive_anon: usize,
    pub active_file: usize,
    pub inactive_file: usize,
    pub unevictable: usize,
    pub dirty: usize,
    pub writeback: usize,
    /// Páginas livres estacionadas nos estoques per-CPU, fora do buddy.
    pub pcp_parked: usize,
    pub pcp_batch: usize,
    pub pcp_high: usize,
    pub all_unreclaimable: bool,
}

// =============================================================================
// ZONA
// =============================================================================

pub struct Zone {
    kind: ZoneKind,
    range: PfnRange,
    /// Páginas realmente entregues ao buddy (cresce no bootstrap).
    managed_pages: AtomicUsize,

    /// Marcas d'água indexadas por `WatermarkLevel`.
    watermark: [AtomicUsize; 3],
    /// Proteção contra alocações que poderiam usar zonas mais altas,
    /// indexada pela classe mais alta permitida na alocação.
    lowmem_reserve: [AtomicUsize; ZONE_KIND_COUNT],

    /// Áreas livres do buddy. Lock de zona.
    free_areas: Mutex<FreeAreas>,
    /// Caches de ordem 0, um slot por CPU.
    pcp: Box<[Mutex<PerCpuPages>]>,
    /// Listas LRU e estatísticas recentes. Lock de LRU.
    lru: Mutex<LruSet>,

    pub counters: ZoneCounters,
    pub flags: ZoneFlags,

    /// Tipo de migração de cada pageblock; escrito sob o lock do buddy,
    /// lido sem lock.
    pageblock_types: Box<[AtomicU8]>,
}

impl Zone {
    pub fn new(kind: ZoneKind, range: PfnRange) -> Self {
        let span = range.len();
        let nr_blocks = align_up(span, PAGEBLOCK_PAGES) >> PAGEBLOCK_ORDER;
        let mut blocks = Vec::with_capacity(nr_blocks);
        for _ in 0..nr_blocks {
            blocks.push(AtomicU8::new(MigrateType::Movable as u8));
        }
        let mut pcp = Vec::with_capacity(MAX_CPUS);
        for _ in 0..MAX_CPUS {
            pcp.push(Mutex::new(PerCpuPages::new()));
        }
        const ZERO: AtomicUsize = AtomicUsize::new(0);
        Self {
            kind,
            range,
            managed_pages: AtomicUsize::new(0),
            watermark: [ZERO; 3],
            lowmem_reserve: [ZERO; ZONE_KIND_COUNT],
            free_areas: Mutex::new(FreeAreas::new(span)),
            pcp: pcp.into_boxed_slice(),
            lru: Mutex::new(LruSet::new(span)),
            counters: ZoneCounters::new(),
            flags: ZoneFlags::new(),
            pageblock_types: blocks.into_boxed_slice(),
        }
    }

    pub fn kind(&self) -> ZoneKind {
        self.kind
    }

    pub fn range(&self) -> PfnRange {
        self.range
    }

    pub fn contains(&self, pfn: usize) -> bool {
        self.range.contains(pfn)
    }

    pub fn spanned_pages(&self) -> usize {
        self.range.len()
    }

    pub fn managed_pages(&self) -> usize {
        self.managed_pages.load(Ordering::Relaxed)
    }

    pub(crate) fn grow_managed(&self, pages: usize) {
        self.managed_pages.fetch_add(pages, Ordering::Relaxed);
    }

    pub fn free_pages(&self) -> usize {
        self.counters.free_pages.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Marcas d'água e proteção de lowmem
    // -------------------------------------------------------------------------

    pub fn watermark(&self, level: WatermarkLevel) -> usize {
        self.watermark[level as usize].load(Ordering::Relaxed)
    }

    /// Recalcula min/low/high a partir da fatia desta zona do piso
    /// global de páginas livres.
    pub(crate) fn set_min_watermark(&self, min: usize) {
        self.watermark[WatermarkLevel::Min as usize].store(min, Ordering::Relaxed);
        self.watermark[WatermarkLevel::Low as usize].store(min + (min >> 2), Ordering::Relaxed);
        self.watermark[WatermarkLevel::High as usize].store(min + (min >> 1), Ordering::Relaxed);
    }

    pub fn lowmem_reserve(&self, classzone: ZoneKind) -> usize {
        self.lowmem_reserve[classzone.as_usize()].load(Ordering::Relaxed)
    }

    pub(crate) fn set_lowmem_reserve(&self, classzone: ZoneKind, pages: usize) {
        self.lowmem_reserve[classzone.as_usize()].store(pages, Ordering::Relaxed);
    }

    /// Teste de marca d'água ciente de ordem. A fronteira é inclusiva:
    /// uma zona exatamente na marca ainda passa.
    ///
    /// Desconta do total livre as páginas que uma alocação de `order`
    /// consumiria e exige que as ordens abaixo não respondam sozinhas
    /// pelo que sobra: a cada ordem subtrai os blocos daquele tamanho e
    /// meia o piso exigido.
    pub fn watermark_ok(&self, order: usize, mark: usize, reserve: usize) -> bool {
        let mut free = self.free_pages() as i64 - ((1i64 << order) - 1);
        let mut min = mark as i64;

        if free < min + reserve as i64 {
            return false;
        }
        if order == 0 {
            return true;
        }

        let areas = self.free_areas.lock();
        for o in 0..order {
            free -= (areas.nr_free_order(o) << o) as i64;
            min >>= 1;
            if free < min {
                return false;
            }
        }
        true
    }

    // -------------------------------------------------------------------------
    // Acesso às estruturas protegidas
    // -------------------------------------------------------------------------

    pub(crate) fn free_areas(&self) -> &Mutex<FreeAreas> {
        &self.free_areas
    }

    pub(crate) fn lru(&self) -> &Mutex<LruSet> {
        &self.lru
    }

    pub(crate) fn pcp(&self, cpu: usize) -> &Mutex<PerCpuPages> {
        &self.pcp[cpu % self.pcp.len()]
    }

    pub(crate) fn pcp_slots(&self) -> usize {
        self.pcp.len()
    }

    // -------------------------------------------------------------------------
    // Tipos de pageblock
    // -------------------------------------------------------------------------

    fn pageblock_index(&self, pfn: usize) -> usize {
        debug_assert!(self.contains(pfn));
        (pfn - self.range.start) >> PAGEBLOCK_ORDER
    }

    pub fn pageblock_type(&self, pfn: usize) -> MigrateType {
        let raw = self.pageblock_types[self.pageblock_index(pfn)].load(Ordering::Relaxed);
        MigrateType::from_u8(raw)
    }

    pub(crate) fn set_pageblock_type(&self, pfn: usize, mt: MigrateType) {
        self.pageblock_types[self.pageblock_index(pfn)].store(mt as u8, Ordering::Relaxed);
    }

    /// Início (PFN) do pageblock que contém `pfn`, recortado à zona.
    pub(crate) fn pageblock_start(&self, pfn: usize) -> usize {
        self.range.start + align_down(pfn - self.range.start, PAGEBLOCK_PAGES)
    }

    // -------------------------------------------------------------------------
    // Pressão de reclaim
    // -------------------------------------------------------------------------

    /// Páginas que o reclaim teria como recuperar. Sem swap, as listas
    /// anônimas não contam.
    pub fn reclaimable_pages(&self, swap_enabled: bool) -> usize {
        let file = self.counters.lru_count(LruKind::ActiveFile)
            + self.counters.lru_count(LruKind::InactiveFile);
        if swap_enabled {
            file + self.counters.lru_count(LruKind::ActiveAnon)
                + self.counters.lru_count(LruKind::InactiveAnon)
        } else {
            file
        }
    }

    pub fn is_all_unreclaimable(&self) -> bool {
        self.flags.test(ZONE_ALL_UNRECLAIMABLE)
    }

    /// Toda liberação de páginas anistia a zona: zera o acumulador de
    /// scan e derruba o veredito de irrecuperável.
    pub(crate) fn note_pages_freed(&self) {
        self.counters.pages_scanned.store(0, Ordering::Relaxed);
        if self.is_all_unreclaimable() {
            self.flags.clear(ZONE_ALL_UNRECLAIMABLE);
        }
    }

    // -------------------------------------------------------------------------
    // Relatório
    // -------------------------------------------------------------------------

    pub fn usage(&self) -> ZoneUsage {
        let mut pcp_parked = 0;
        for slot in self.pcp.iter() {
            pcp_parked += slot.lock().count();
        }
        // Todos os slots recebem o mesmo dimensionamento.
        let (pcp_batch, pcp_high) = {
            let first = self.pcp[0].lock();
            (first.batch(), first.high())
        };
        ZoneUsage {
            kind: self.kind,
            spanned: self.spanned_pages(),
            managed: self.managed_pages(),
            free: self.free_pages(),
            wmark_min: self.watermark(WatermarkLevel::Min),
            wmark_low: self.watermark(WatermarkLevel::Low),
            wmark_high: self.watermark(WatermarkLevel::High),
            active_anon: self.counters.lru_count(LruKind::ActiveAnon),
            inactive_anon: self.counters.lru_count(LruKind::InactiveAnon),
            active_file: self.counters.lru_count(LruKind::ActiveFile),
            inactive_file: self.counters.lru_count(LruKind::InactiveFile),
            unevictable: self.counters.lru_count(LruKind::Unevictable),
            dirty: self.counters.dirty.load(Ordering::Relaxed),
            writeback: self.counters.writeback.load(Ordering::Relaxed),
            pcp_parked,
            pcp_batch,
            pcp_high,
            all_unreclaimable: self.is_all_unreclaimable(),
        }
    }
}

// =============================================================================
// TESTES
// =============================================================================
