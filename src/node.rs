//! # O Nó de Memória Física
//!
//! `SystemMemory` é o contexto raiz do subsistema: a tabela de frames,
//! as zonas com seus buddies e LRUs, os ganchos para os colaboradores
//! externos, os contadores de eventos e os tunables. Tudo que as outras
//! camadas fazem acontece dentro de um nó.
//!
//! O bootstrap segue três passos, nesta ordem:
//!
//! 1. `SystemMemory::new` declara a topologia (spans por zona). Nenhuma
//!    página é utilizável ainda: todos os frames nascem RESERVED.
//! 2. `free_bootmem` entrega os intervalos realmente disponíveis ao
//!    buddy, uma região por vez.
//! 3. `set_min_free_pages` calibra marcas d'água, proteção de lowmem,
//!    pageblocks de reserva e lotes per-CPU.
//!
//! O embutidor é dono da thread de background: quando o hook
//! `kswapd_wakeup` sinaliza, ele chama `run_background_reclaim` no
//! contexto que preferir.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use spin::Mutex;

use crate::buddy;
use crate::config::{
    DEFAULT_LOWMEM_RESERVE_RATIO, DEFAULT_MIN_FREE_PAGES, DEFAULT_PAGEBLOCK_CLAIM_ORDER,
    DEFAULT_SWAPPINESS, MAX_CPUS, MAX_ORDER, PAGEBLOCK_ORDER,
};
use crate::error::{MmError, MmResult};
use crate::gfp::GfpFlags;
use crate::hooks::HookSet;
use crate::page::{FrameTable, MappingId, PageDescriptor, PageFlags, PageRun, RunInfo, NO_MAPPING};
use crate::page_alloc::{self, AllocFlags};
use crate::pcp;
use crate::reclaim::kswapd::{self, KswapdControl};
use crate::reclaim::lru::LruKind;
use crate::shrinker::{Shrinker, ShrinkerId, ShrinkerRegistry};
use crate::stats::{VmEvents, VmEventsSnapshot};
use crate::zone::{PfnRange, WatermarkLevel, Zone, ZoneKind, ZoneUsage, ZONE_KIND_COUNT};

// =============================================================================
// TOPOLOGIA
// =============================================================================

/// Um intervalo físico contíguo atribuído a uma zona. Spans de zonas
/// distintas não podem se sobrepor.
#[derive(Debug, Clone, Copy)]
pub struct MemorySpan {
    pub kind: ZoneKind,
    pub range: PfnRange,
}

// =============================================================================
// TUNABLES
// =============================================================================

/// Botões de ajuste expostos ao embutidor. Todos podem mudar em tempo
/// de execução; os caminhos quentes leem com `Relaxed` e toleram ver o
/// valor antigo por uma rodada.
pub(crate) struct Tunables {
    min_free_pages: AtomicUsize,
    swappiness: AtomicU32,
    pageblock_claim_order: AtomicUsize,
    zone_reclaim_mode: AtomicBool,
    lowmem_reserve_ratio: [usize; ZONE_KIND_COUNT],
}

impl Tunables {
    fn new() -> Self {
        Self {
            min_free_pages: AtomicUsize::new(DEFAULT_MIN_FREE_PAGES),
            swappiness: AtomicU32::new(DEFAULT_SWAPPINESS),
            pageblock_claim_order: AtomicUsize::new(DEFAULT_PAGEBLOCK_CLAIM_ORDER),
            zone_reclaim_mode: AtomicBool::new(false),
            lowmem_reserve_ratio: DEFAULT_LOWMEM_RESERVE_RATIO,
        }
    }

    pub(crate) fn min_free_pages(&self) -> usize {
        self.min_free_pages.load(Ordering::Relaxed)
    }

    pub(crate) fn swappiness(&self) -> u32 {
        self.swappiness.load(Ordering::Relaxed)
    }

    pub(crate) fn claim_order(&self) -> usize {
        self.pageblock_claim_order.load(Ordering::Relaxed)
    }

    pub(crate) fn zone_reclaim_enabled(&self) -> bool {
        self.zone_reclaim_mode.load(Ordering::Relaxed)
    }
}

// =============================================================================
// O NÓ
// =============================================================================

/// Estado completo de um nó de memória física.
///
/// Vive atrás de um `Arc`: cada `PageRun` emitido carrega uma referência
/// ao nó para poder devolver o bloco sozinho no drop. As zonas são fixas
/// desde a construção; só o total gerido cresce, via `free_bootmem`.
pub struct SystemMemory {
    pub(crate) frames: FrameTable,
    zones: [Zone; ZONE_KIND_COUNT],
    pub(crate) events: VmEvents,
    pub(crate) tunables: Tunables,
    pub(crate) hooks: HookSet,
    pub(crate) kswapd: KswapdControl,
    pub(crate) shrinkers: ShrinkerRegistry,
    /// Serializa os episódios de OOM; ver `oom::out_of_memory`.
    pub(crate) oom_lock: Mutex<()>,
}

impl SystemMemory {
    /// Declara a topologia do nó. Nenhuma página fica utilizável até o
    /// primeiro `free_bootmem`.
    pub fn new(spans: &[MemorySpan], hooks: HookSet) -> Arc<Self> {
        let mut ranges = [PfnRange::new(0, 0); ZONE_KIND_COUNT];
        for span in spans {
            let slot = &mut ranges[span.kind.as_usize()];
            if slot.is_empty() {
                *slot = span.range;
            } else {
                *slot = PfnRange::new(
                    slot.start.min(span.range.start),
                    slot.end.max(span.range.end),
                );
            }
        }
        let base = spans.iter().map(|s| s.range.start).min().unwrap_or(0);
        let end = spans.iter().map(|s| s.range.end).max().unwrap_or(0);

        let node = Arc::new(Self {
            frames: FrameTable::new(base, end - base),
            zones: core::array::from_fn(|i| Zone::new(ZoneKind::ALL[i], ranges[i])),
            events: VmEvents::new(),
            tunables: Tunables::new(),
            hooks,
            kswapd: KswapdControl::new(),
            shrinkers: ShrinkerRegistry::new(),
            oom_lock: Mutex::new(()),
        });
        crate::kinfo!(
            "(PMM) nó inicializado: PFNs {}..{}, {} spans",
            base,
            end,
            spans.len()
        );
        node
    }

    // -------------------------------------------------------------------------
    // Topologia
    // -------------------------------------------------------------------------

    pub fn zone(&self, kind: ZoneKind) -> &Zone {
        &self.zones[kind.as_usize()]
    }

    /// Zonas elegíveis para uma classe de chamador, da mais alta para a
    /// mais baixa. Zonas vazias ficam no caminho; quem percorre pula.
    pub(crate) fn zones_for(&self, classzone: ZoneKind) -> impl Iterator<Item = &Zone> {
        self.zones[..=classzone.as_usize()].iter().rev()
    }

    fn zone_of(&self, pfn: usize) -> &Zone {
        self.zones
            .iter()
            .find(|zone| zone.contains(pfn))
            .expect("PFN fora de qualquer zona declarada")
    }

    #[inline]
    pub(crate) fn page(&self, pfn: usize) -> &PageDescriptor {
        self.frames.page(pfn)
    }

    // -------------------------------------------------------------------------
    // Bootstrap
    // -------------------------------------------------------------------------

    /// Entrega um intervalo físico utilizável ao buddy. A parte que cair
    /// dentro de cada zona é liberada e passa a contar como gerida; PFNs
    /// fora de qualquer zona declarada são ignorados.
    pub fn free_bootmem(&self, range: PfnRange) -> usize {
        let mut total = 0;
        for zone in self.zones.iter() {
            let start = range.start.max(zone.range().start);
            let end = range.end.min(zone.range().end);
            if start >= end {
                continue;
            }
            let freed = buddy::free_boot_range(zone, &self.frames, PfnRange::new(start, end));
            pcp::configure_zone(zone);
            total += freed;
        }
        if total > 0 {
            crate::kdebug!(
                "(PMM) bootmem: {} páginas liberadas em {}..{}",
                total,
                range.start,
                range.end
            );
        }
        total
    }

    /// Fixa o piso global de páginas livres e recalcula tudo que deriva
    /// dele: marcas min/low/high por zona, proteção de lowmem, blocos
    /// de reserva e lotes per-CPU.
    pub fn set_min_free_pages(&self, pages: usize) {
        self.tunables.min_free_pages.store(pages, Ordering::Relaxed);
        self.rebalance_thresholds();
    }

    fn rebalance_thresholds(&self) {
        let min_free = self.tunables.min_free_pages();
        let total_managed: usize = self.zones.iter().map(Zone::managed_pages).sum();
        if total_managed == 0 {
            return;
        }

        // Cada zona recebe a fatia do piso proporcional ao seu tamanho.
        for zone in self.zones.iter() {
            let managed = zone.managed_pages();
            if managed == 0 {
                continue;
            }
            let min = min_free * managed / total_managed;
            zone.set_min_watermark(min);
            buddy::setup_migrate_reserve(zone, &self.frames);
            pcp::configure_zone(zone);
        }

        // Proteção de lowmem: a zona z cobra de quem poderia alocar numa
        // classe c mais alta uma fração do total gerido entre z e c.
        for (zi, zone) in self.zones.iter().enumerate() {
            let ratio = self.tunables.lowmem_reserve_ratio[zi];
            for (ci, class) in ZoneKind::ALL.iter().enumerate() {
                let reserve = if ci <= zi || ratio == 0 {
                    0
                } else {
                    let above: usize = self.zones[zi + 1..=ci]
                        .iter()
                        .map(Zone::managed_pages)
                        .sum();
                    above / ratio
                };
                zone.set_lowmem_reserve(*class, reserve);
            }
        }
        crate::kdebug!("(PMM) marcas recalculadas: piso global {}", min_free);
    }

    // -------------------------------------------------------------------------
    // Alocação
    // -------------------------------------------------------------------------

    /// Aloca um bloco de `2^order` páginas contíguas. O handle devolvido
    /// é dono do bloco: o drop da última clone o devolve ao buddy.
    pub fn allocate(self: &Arc<Self>, order: usize, gfp: GfpFlags) -> MmResult<PageRun> {
        if order >= MAX_ORDER {
            return Err(MmError::OrderTooLarge);
        }
        let mt = gfp.migratetype();
        let classzone = gfp.highest_zone();

        let info = match page_alloc::get_page_from_freelist(
            self,
            order,
            gfp,
            mt,
            WatermarkLevel::Low,
            AllocFlags::empty(),
            classzone,
        ) {
            Some(info) => info,
            None => page_alloc::allocate_slowpath(self, order, gfp, mt, classzone)?,
        };

        self.events
            .pgalloc
            .fetch_add(info.pages() as u64, Ordering::Relaxed);
        if gfp.contains(GfpFlags::ZERO_FILL) {
            self.hooks.cache.zero_pages(info.pfn, info.pages());
        }
        Ok(PageRun::new(self.clone(), info))
    }

    /// Atalho para `allocate` com `ZERO_FILL`.
    pub fn allocate_zeroed(self: &Arc<Self>, order: usize, gfp: GfpFlags) -> MmResult<PageRun> {
        self.allocate(order, gfp | GfpFlags::ZERO_FILL)
    }

    /// Devolve ao buddy um bloco cuja última referência caiu. Ordem 0
    /// passa pelo estoque per-CPU; ordens maiores vão direto.
    pub(crate) fn release_run(&self, info: RunInfo) {
        let zone = self.zone_of(info.pfn);
        let desc = self.frames.page(info.pfn);
        debug_assert_eq!(desc.ref_count(), 0);
        debug_assert!(!desc.test(PageFlags::LRU), "bloco livre ainda no LRU");

        self.events
            .pgfree
            .fetch_add(info.pages() as u64, Ordering::Relaxed);

        // O conteúdo morre junto com o bloco: páginas ainda sujas saem
        // do contador da zona antes do reset de flags engolir o bit.
        let mut dirty = 0;
        for pfn in info.pfn..info.pfn + info.pages() {
            if self.frames.page(pfn).test_and_clear(PageFlags::DIRTY) {
                dirty += 1;
            }
        }
        if dirty > 0 {
            zone.counters.dirty.fetch_sub(dirty, Ordering::Relaxed);
        }

        desc.set_mapping(NO_MAPPING);
        if info.order == 0 {
            let cpu = self.hooks.sched.current_cpu();
            pcp::free_page(zone, &self.frames, &self.events, cpu, info.pfn, false);
        } else {
            desc.reset_flags(PageFlags::empty());
            desc.set_private(0);
            buddy::free_block(zone, &self.frames, info.pfn, info.order);
        }
    }

    // -------------------------------------------------------------------------
    // Superfície LRU para o dono das páginas
    // -------------------------------------------------------------------------

    /// Entrega uma página de ordem 0 ao LRU da sua zona. A referência do
    /// handle passa a pertencer ao mapeamento; `NO_MAPPING` declara a
    /// página anônima (o backing dela será um slot de swap).
    pub fn lru_add(&self, run: PageRun, mapping: MappingId) {
        let info = run.into_raw();
        debug_assert_eq!(info.order, 0, "o LRU só conhece páginas de ordem 0");
        let zone = self.zone_of(info.pfn);
        let desc = self.frames.page(info.pfn);

        desc.set_mapping(mapping);
        if mapping == NO_MAPPING {
            desc.set(PageFlags::SWAP_BACKED);
        }
        let kind = LruKind::for_page(desc);
        desc.set(PageFlags::LRU);

        let rel = (info.pfn - zone.range().start) as u32;
        zone.lru().lock().push_head(rel, kind);
        zone.counters.lru_add(kind, 1);
    }

    /// Registra um toque na página. O primeiro arma o bit de referência;
    /// o segundo promove para a lista ativa. É a escada clássica de dois
    /// degraus contra poluição por acesso único.
    pub fn mark_accessed(&self, pfn: usize) {
        let desc = self.frames.page(pfn);
        if desc.test(PageFlags::ACTIVE) || !desc.test(PageFlags::LRU) {
            desc.set(PageFlags::REFERENCED);
            return;
        }
        if !desc.test_and_clear(PageFlags::REFERENCED) {
            desc.set(PageFlags::REFERENCED);
            return;
        }

        let zone = self.zone_of(pfn);
        let rel = (pfn - zone.range().start) as u32;
        let mut lru = zone.lru().lock();
        let from = LruKind::for_page(desc);
        if from == LruKind::Unevictable {
            desc.set(PageFlags::REFERENCED);
            return;
        }
        lru.remove(rel, from);
        zone.counters.lru_sub(from, 1);
        desc.set(PageFlags::ACTIVE);
        let to = LruKind::for_page(desc);
        lru.push_head(rel, to);
        zone.counters.lru_add(to, 1);
        self.events.pgactivate.fetch_add(1, Ordering::Relaxed);
    }

    /// Marca o conteúdo como divergente do backing store.
    pub fn set_page_dirty(&self, pfn: usize) {
        let desc = self.frames.page(pfn);
        if !desc.test_and_set(PageFlags::DIRTY) {
            self.zone_of(pfn)
                .counters
                .dirty
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Conclusão de IO vinda do backing store. Se o reclaim deixou a
    /// etiqueta RECLAIM na página, ela gira para a cauda da sua lista:
    /// é a próxima candidata do isolamento, agora limpa.
    pub fn end_writeback(&self, pfn: usize) {
        let desc = self.frames.page(pfn);
        let zone = self.zone_of(pfn);
        if desc.test_and_clear(PageFlags::WRITEBACK) {
            zone.counters.writeback.fetch_sub(1, Ordering::Relaxed);
        }
        if desc.test_and_clear(PageFlags::RECLAIM)
            && desc.test(PageFlags::LRU)
            && !desc.test(PageFlags::ACTIVE)
            && !desc.test(PageFlags::UNEVICTABLE)
        {
            let rel = (pfn - zone.range().start) as u32;
            let kind = LruKind::for_page(desc);
            let mut lru = zone.lru().lock();
            lru.remove(rel, kind);
            lru.push_tail(rel, kind);
            drop(lru);
            self.events.pgrotated.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Mais uma page table passou a apontar para a página.
    pub fn page_mapped(&self, pfn: usize) {
        self.frames.page(pfn).inc_map_count();
    }

    /// Um mapeamento desfeito.
    pub fn page_unmapped(&self, pfn: usize) {
        self.frames.page(pfn).dec_map_count();
    }

    /// Tranca a página contra reclaim. Se ela já estiver numa lista LRU
    /// muda para a de inevictáveis agora; senão o próprio isolamento a
    /// rerroteia quando topar com ela.
    pub fn mlock(&self, pfn: usize) {
        let desc = self.frames.page(pfn);
        if desc.test_and_set(PageFlags::MLOCKED) || !desc.test(PageFlags::LRU) {
            return;
        }
        let zone = self.zone_of(pfn);
        let rel = (pfn - zone.range().start) as u32;
        let mut lru = zone.lru().lock();
        let from = LruKind::for_page(desc);
        if from == LruKind::Unevictable {
            return;
        }
        lru.remove(rel, from);
        zone.counters.lru_sub(from, 1);
        desc.clear(PageFlags::ACTIVE);
        desc.set(PageFlags::UNEVICTABLE);
        lru.push_head(rel, LruKind::Unevictable);
        zone.counters.lru_add(LruKind::Unevictable, 1);
    }

    /// Destranca e resgata a página para a lista evictável da sua
    /// espécie.
    pub fn munlock(&self, pfn: usize) {
        let desc = self.frames.page(pfn);
        if !desc.test_and_clear(PageFlags::MLOCKED) {
            return;
        }
        if !desc.test(PageFlags::LRU) || !desc.test(PageFlags::UNEVICTABLE) {
            return;
        }
        let zone = self.zone_of(pfn);
        let rel = (pfn - zone.range().start) as u32;
        let mut lru = zone.lru().lock();
        lru.remove(rel, LruKind::Unevictable);
        zone.counters.lru_sub(LruKind::Unevictable, 1);
        desc.clear(PageFlags::UNEVICTABLE);
        let to = LruKind::for_page(desc);
        lru.push_head(rel, to);
        zone.counters.lru_add(to, 1);
    }

    // -------------------------------------------------------------------------
    // Reclaim em background
    // -------------------------------------------------------------------------

    /// Arma o pedido de balanceamento se alguma zona elegível estiver
    /// abaixo da marca baixa. O sinal ao embutidor só dispara na borda:
    /// pedidos com o daemon já acordado apenas elevam a meta.
    pub(crate) fn wake_kswapd(&self, order: usize, classzone: ZoneKind) {
        let mut pressured = false;
        for zone in self.zones_for(classzone) {
            if zone.managed_pages() == 0 {
                continue;
            }
            if !zone.watermark_ok(order, zone.watermark(WatermarkLevel::Low), 0) {
                pressured = true;
                break;
            }
        }
        if !pressured {
            return;
        }
        if self.kswapd.request(order, classzone) {
            self.events.kswapd_wakeups.fetch_add(1, Ordering::Relaxed);
            self.hooks.sched.kswapd_wakeup();
        }
    }

    /// Pedido externo de balanceamento assíncrono, com a mesma filtragem
    /// do despertar que o alocador dispara sob pressão.
    pub fn kick_background_reclaim(&self, order: usize, classzone: ZoneKind) {
        self.wake_kswapd(order, classzone);
    }

    /// Corpo do daemon de background. O embutidor chama isto na thread
    /// dele ao receber `kswapd_wakeup`; a função consome os pedidos
    /// armados e balanceia até as zonas alcançarem a marca alta ou serem
    /// declaradas irrecuperáveis.
    pub fn run_background_reclaim(&self) {
        while let Some((order, classzone)) = self.kswapd.take() {
            loop {
                kswapd::balance_node(self, order, classzone);
                if !kswapd::sleeping_prematurely(self, order, classzone) {
                    break;
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Estoques per-CPU
    // -------------------------------------------------------------------------

    /// Verte todos os estoques per-CPU de volta ao buddy. Devolve o
    /// total de páginas que voltou.
    pub fn drain_all(&self) -> usize {
        let mut drained = 0;
        for zone in self.zones.iter() {
            if zone.managed_pages() == 0 {
                continue;
            }
            for cpu in 0..zone.pcp_slots() {
                drained += pcp::drain_cpu(zone, &self.frames, &self.events, cpu);
            }
        }
        drained
    }

    /// Verte os estoques de uma CPU específica em todas as zonas.
    pub fn drain_cpu(&self, cpu: usize) -> MmResult<usize> {
        if cpu >= MAX_CPUS {
            return Err(MmError::InvalidParameter);
        }
        let mut drained = 0;
        for zone in self.zones.iter() {
            if zone.managed_pages() == 0 {
                continue;
            }
            drained += pcp::drain_cpu(zone, &self.frames, &self.events, cpu);
        }
        Ok(drained)
    }

    // -------------------------------------------------------------------------
    // Shrinkers
    // -------------------------------------------------------------------------

    /// Inscreve um cache auxiliar para receber pressão junto com o LRU.
    pub fn register_shrinker(&self, shrinker: Arc<dyn Shrinker>) -> ShrinkerId {
        self.shrinkers.register(shrinker)
    }

    /// Remove um shrinker. Devolve `false` se o id já não existia.
    pub fn unregister_shrinker(&self, id: ShrinkerId) -> bool {
        self.shrinkers.unregister(id)
    }

    // -------------------------------------------------------------------------
    // Tunables
    // -------------------------------------------------------------------------

    /// Balanço anon/file do reclaim, 0..=200. Acima de 100 favorece swap
    /// com agressividade crescente.
    pub fn set_swappiness(&self, value: u32) -> MmResult<()> {
        if value > 200 {
            return Err(MmError::InvalidParameter);
        }
        self.tunables.swappiness.store(value, Ordering::Relaxed);
        Ok(())
    }

    /// Ordem mínima de fallback que vira posse do pageblock inteiro.
    pub fn set_claim_order(&self, order: usize) -> MmResult<()> {
        if order > PAGEBLOCK_ORDER {
            return Err(MmError::InvalidParameter);
        }
        self.tunables
            .pageblock_claim_order
            .store(order, Ordering::Relaxed);
        Ok(())
    }

    /// Liga o reclaim local: uma zona reprovada na admissão tenta se
    /// aliviar antes de a busca descer para a zona seguinte.
    pub fn set_zone_reclaim(&self, enabled: bool) {
        self.tunables
            .zone_reclaim_mode
            .store(enabled, Ordering::Relaxed);
    }

    // -------------------------------------------------------------------------
    // Relatórios
    // -------------------------------------------------------------------------

    /// Fotografia das zonas povoadas.
    pub fn usage(&self) -> Vec<ZoneUsage> {
        self.zones
            .iter()
            .filter(|zone| zone.managed_pages() > 0)
            .map(Zone::usage)
            .collect()
    }

    /// Fotografia dos contadores de eventos.
    pub fn event_snapshot(&self) -> VmEventsSnapshot {
        self.events.snapshot()
    }

    /// Despeja o estado do nó no log, zona a zona.
    pub fn report(&self) {
        for usage in self.usage() {
            crate::kinfo!(
                "(PMM) zona {}: {} geridas, {} livres, marcas {}/{}/{}, pcp {} (lote {}, teto {})",
                usage.kind.name(),
                usage.managed,
                usage.free,
                usage.wmark_min,
                usage.wmark_low,
                usage.wmark_high,
                usage.pcp_parked,
                usage.pcp_batch,
                usage.pcp_high
            );
        }
        self.events.report();
    }
}

// =============================================================================
// TESTES
// =============================================================================

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use spin::Mutex;

    use super::*;
    use crate::hooks::mock::{RecordingCache, RecordingSched, ScriptedOom};
    use crate::hooks::{OomHooks, OomVerdict};

    fn fixture(pages: usize) -> (Arc<SystemMemory>, Arc<RecordingSched>, Arc<ScriptedOom>) {
        let sched = Arc::new(RecordingSched::default());
        let oomk = Arc::new(ScriptedOom::default());
        let mut hooks = HookSet::null();
        hooks.sched = sched.clone();
        hooks.oom = oomk.clone();
        let spans = [MemorySpan {
            kind: ZoneKind::Normal,
            range: PfnRange::new(0, pages),
        }];
        let mem = SystemMemory::new(&spans, hooks);
        mem.free_bootmem(PfnRange::new(0, pages));
        (mem, sched, oomk)
    }

    /// Aloca ordem 0 até a zona ficar com exatamente `target` livres.
    fn drain_to(mem: &Arc<SystemMemory>, target: usize) -> Vec<PageRun> {
        let zone = mem.zone(ZoneKind::Normal);
        let mut held = Vec::new();
        while zone.free_pages() > target {
            held.push(mem.allocate(0, GfpFlags::KERNEL).unwrap());
        }
        held
    }

    #[test]
    fn conservation_survives_a_mixed_churn() {
        let (mem, _, _) = fixture(1024);
        let zone = mem.zone(ZoneKind::Normal);
        assert_eq!(zone.managed_pages(), 1024);
        assert_eq!(zone.free_pages(), 1024);

        let mut held = Vec::new();
        for order in [0usize, 1, 2, 3, 0, 4] {
            for _ in 0..8 {
                held.push(mem.allocate(order, GfpFlags::KERNEL).unwrap());
            }
        }
        assert_eq!(zone.free_pages(), 1024 - 256);

        // Solta metade fora de ordem, depois o resto.
        for _ in 0..held.len() / 2 {
            let mid = held.len() / 2;
            drop(held.swap_remove(mid));
        }
        held.clear();
        mem.drain_all();

        assert_eq!(zone.free_pages(), 1024);
        // Tudo fundiu de volta num bloco máximo único.
        assert_eq!(zone.free_areas().lock().nr_free_order(MAX_ORDER - 1), 1);
        let snap = mem.event_snapshot();
        assert_eq!(snap.pgalloc, snap.pgfree);
    }

    #[test]
    fn raii_handle_frees_on_the_last_drop() {
        let (mem, _, _) = fixture(256);
        let zone = mem.zone(ZoneKind::Normal);

        let run = mem.allocate(0, GfpFlags::KERNEL).unwrap();
        let pfn = run.pfn();
        assert_eq!(zone.free_pages(), 255);

        let dup = run.clone();
        drop(run);
        // A clone ainda segura a página.
        assert_eq!(mem.frames.page(pfn).ref_count(), 1);
        assert_eq!(zone.free_pages(), 255);

        drop(dup);
        assert_eq!(mem.frames.page(pfn).ref_count(), 0);
        // Ordem 0 estaciona no per-CPU; o dreno devolve ao buddy.
        mem.drain_all();
        assert_eq!(zone.free_pages(), 256);
        assert!(mem.frames.page(pfn).test(PageFlags::BUDDY));
    }

    #[test]
    fn dirty_marks_die_with_the_block() {
        let (mem, _, _) = fixture(256);
        let zone = mem.zone(ZoneKind::Normal);

        let page = mem.allocate(0, GfpFlags::KERNEL).unwrap();
        let pfn = page.pfn();
        mem.set_page_dirty(pfn);
        assert_eq!(zone.counters.dirty.load(Ordering::Relaxed), 1);
        drop(page);
        assert_eq!(zone.counters.dirty.load(Ordering::Relaxed), 0);
        assert!(!mem.frames.page(pfn).test(PageFlags::DIRTY));

        // Bloco de ordem alta acerta todas as páginas, não só a cabeça.
        let run = mem.allocate(1, GfpFlags::KERNEL).unwrap();
        mem.set_page_dirty(run.pfn());
        mem.set_page_dirty(run.pfn() + 1);
        assert_eq!(zone.counters.dirty.load(Ordering::Relaxed), 2);
        drop(run);
        assert_eq!(zone.counters.dirty.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn zero_fill_runs_through_the_cache_hook() {
        let cache = Arc::new(RecordingCache::default());
        let mut hooks = HookSet::null();
        hooks.cache = cache.clone();
        let spans = [MemorySpan {
            kind: ZoneKind::Normal,
            range: PfnRange::new(0, 256),
        }];
        let mem = SystemMemory::new(&spans, hooks);
        mem.free_bootmem(PfnRange::new(0, 256));

        let run = mem.allocate_zeroed(2, GfpFlags::KERNEL).unwrap();
        assert_eq!(cache.zeroed.lock().as_slice(), &[(run.pfn(), 4)]);

        let _plain = mem.allocate(0, GfpFlags::KERNEL).unwrap();
        assert_eq!(cache.zeroed.lock().len(), 1);
    }

    #[test]
    fn plain_alloc_and_free_never_touch_the_flush_hook() {
        let cache = Arc::new(RecordingCache::default());
        let mut hooks = HookSet::null();
        hooks.cache = cache.clone();
        let spans = [MemorySpan {
            kind: ZoneKind::Normal,
            range: PfnRange::new(0, 256),
        }];
        let mem = SystemMemory::new(&spans, hooks);
        mem.free_bootmem(PfnRange::new(0, 256));

        let run = mem.allocate(0, GfpFlags::KERNEL).unwrap();
        let big = mem.allocate_zeroed(3, GfpFlags::KERNEL).unwrap();
        drop(run);
        drop(big);
        mem.drain_all();

        // O flush pertence à camada de mapeamento, na troca de
        // identidade da página; alocar e devolver não disparam nenhum.
        assert!(cache.flushed.lock().is_empty());
        assert_eq!(cache.zeroed.lock().len(), 1);
    }

    #[test]
    fn the_slowpath_ladder_descends_to_the_min_mark() {
        let (mem, sched, oomk) = fixture(1024);
        mem.set_min_free_pages(64);
        let zone = mem.zone(ZoneKind::Normal);
        assert_eq!(zone.watermark(WatermarkLevel::Low), 80);

        // Fast path até a fronteira inclusiva da marca baixa.
        let mut held = drain_to(&mem, 79);
        assert_eq!(mem.events.pgalloc_slowpath.load(Ordering::Relaxed), 0);

        // Daqui em diante cada pedido cai no slow path e resolve no
        // re-teste da marca mínima, também inclusiva.
        for _ in 0..16 {
            held.push(mem.allocate(0, GfpFlags::KERNEL).unwrap());
        }
        assert_eq!(zone.free_pages(), 63);
        assert_eq!(mem.events.pgalloc_slowpath.load(Ordering::Relaxed), 16);
        // O kswapd foi acordado uma única vez, na borda.
        assert_eq!(mem.events.kswapd_wakeups.load(Ordering::Relaxed), 1);
        assert_eq!(sched.wakeups.load(Ordering::Relaxed), 1);

        // Sem nada reclamável e sem vítima, a exaustão é terminal.
        let verdict = mem.allocate(0, GfpFlags::KERNEL);
        assert!(matches!(verdict, Err(MmError::OutOfMemory)));
        assert_eq!(mem.events.allocstall.load(Ordering::Relaxed), 1);
        assert_eq!(oomk.kills.load(Ordering::Relaxed), 0);
        assert_eq!(sched.waits.load(Ordering::Relaxed), 0);
        assert_eq!(zone.free_pages(), 63);
    }

    #[test]
    fn atomic_bites_the_reserve_but_never_reclaims() {
        let (mem, sched, oomk) = fixture(512);
        mem.set_min_free_pages(64);
        let zone = mem.zone(ZoneKind::Normal);

        let mut held = Vec::new();
        loop {
            match mem.allocate(0, GfpFlags::KERNEL) {
                Ok(run) => held.push(run),
                Err(_) => break,
            }
        }
        assert_eq!(zone.free_pages(), 63);

        // O fast path segue na marca baixa sem privilégio; é o re-teste
        // do slow path que desconta metade e mais um quarto da marca
        // mínima: 64 vira 24, fronteira inclusiva.
        let mut grabbed = 0;
        loop {
            match mem.allocate(0, GfpFlags::ATOMIC) {
                Ok(run) => {
                    held.push(run);
                    grabbed += 1;
                }
                Err(_) => break,
            }
        }
        assert_eq!(grabbed, 40);
        assert_eq!(zone.free_pages(), 23);

        // Nenhum reclaim e nenhuma espera no caminho atômico: só a
        // tentativa KERNEL inicial estagnou.
        assert_eq!(mem.events.allocstall.load(Ordering::Relaxed), 1);
        assert_eq!(oomk.kills.load(Ordering::Relaxed), 0);
        assert_eq!(sched.waits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn memalloc_spends_down_to_the_last_page() {
        let (mem, _, _) = fixture(256);
        mem.set_min_free_pages(64);
        let zone = mem.zone(ZoneKind::Normal);

        let mut held = Vec::new();
        loop {
            match mem.allocate(0, GfpFlags::KERNEL) {
                Ok(run) => held.push(run),
                Err(_) => break,
            }
        }
        assert_eq!(zone.free_pages(), 63);
        let stalls = mem.events.allocstall.load(Ordering::Relaxed);

        // O caminho do próprio reclaim ignora qualquer marca.
        let inner = GfpFlags::KERNEL | GfpFlags::MEMALLOC;
        loop {
            match mem.allocate(0, inner) {
                Ok(run) => held.push(run),
                Err(_) => break,
            }
        }
        assert_eq!(zone.free_pages(), 0);
        // E falha sem reclamar recursivamente quando o buddy seca.
        assert_eq!(mem.events.allocstall.load(Ordering::Relaxed), stalls);
    }

    /// OOM killer que liberta blocos reféns de verdade a cada vítima.
    struct HostageOom {
        hostages: Mutex<Vec<PageRun>>,
        kills: AtomicU64,
    }

    impl OomHooks for HostageOom {
        fn kill_victim(&self, _order: usize, _gfp: GfpFlags) -> OomVerdict {
            let mut hostages = self.hostages.lock();
            if hostages.is_empty() {
                return OomVerdict::NoVictim;
            }
            for _ in 0..4 {
                if hostages.pop().is_none() {
                    break;
                }
            }
            self.kills.fetch_add(1, Ordering::Relaxed);
            OomVerdict::Killed
        }
    }

    #[test]
    fn an_oom_kill_unblocks_the_allocator() {
        let oomk = Arc::new(HostageOom {
            hostages: Mutex::new(Vec::new()),
            kills: AtomicU64::new(0),
        });
        let sched = Arc::new(RecordingSched::default());
        let mut hooks = HookSet::null();
        hooks.sched = sched.clone();
        hooks.oom = oomk.clone();
        let spans = [MemorySpan {
            kind: ZoneKind::Normal,
            range: PfnRange::new(0, 512),
        }];
        let mem = SystemMemory::new(&spans, hooks);
        mem.free_bootmem(PfnRange::new(0, 512));
        mem.set_min_free_pages(64);

        // Blocos de ordem 1 presos no hook: só uma vítima os solta.
        for _ in 0..24 {
            let run = mem.allocate(1, GfpFlags::KERNEL).unwrap();
            oomk.hostages.lock().push(run);
        }
        let held = drain_to(&mem, 63);

        // Sem LRU, o reclaim direto não rende nada; o OOM killer rende.
        let survivor = mem.allocate(0, GfpFlags::KERNEL).unwrap();
        assert!(oomk.kills.load(Ordering::Relaxed) >= 1);
        assert!(mem.events.oom_kills.load(Ordering::Relaxed) >= 1);
        assert!(mem.events.allocstall.load(Ordering::Relaxed) >= 1);
        assert!(sched.waits.load(Ordering::Relaxed) > 0);

        drop(survivor);
        drop(held);
    }

    #[test]
    fn no_retry_gives_up_after_a_single_round() {
        let (mem, sched, oomk) = fixture(256);
        mem.set_min_free_pages(64);
        let _held = drain_to(&mem, 63);

        let verdict = mem.allocate(0, GfpFlags::KERNEL | GfpFlags::NO_RETRY);
        assert!(matches!(verdict, Err(MmError::OutOfMemory)));
        // Uma rodada de reclaim direto, nenhum kill, nenhuma espera.
        assert_eq!(mem.events.allocstall.load(Ordering::Relaxed), 1);
        assert_eq!(oomk.kills.load(Ordering::Relaxed), 0);
        assert_eq!(sched.waits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn a_fatal_signal_aborts_before_any_reclaim() {
        let (mem, sched, _) = fixture(256);
        mem.set_min_free_pages(64);
        let _held = drain_to(&mem, 63);

        sched.fatal.store(true, Ordering::Relaxed);
        let verdict = mem.allocate(0, GfpFlags::KERNEL);
        assert!(matches!(verdict, Err(MmError::OutOfMemory)));
        assert_eq!(mem.events.allocstall.load(Ordering::Relaxed), 0);
        assert_eq!(sched.waits.load(Ordering::Relaxed), 0);
    }

    /// Cache auxiliar de mentira: um contador de objetos que encolhe.
    struct SlabCache {
        objects: AtomicUsize,
    }

    impl Shrinker for SlabCache {
        fn name(&self) -> &str {
            "slab_de_teste"
        }

        fn count_objects(&self) -> usize {
            self.objects.load(Ordering::Relaxed)
        }

        fn scan_objects(&self, nr: usize) -> usize {
            let have = self.objects.load(Ordering::Relaxed);
            let freed = nr.min(have);
            self.objects.store(have - freed, Ordering::Relaxed);
            freed
        }
    }

    #[test]
    fn direct_reclaim_rides_the_lru_and_the_shrinkers() {
        let (mem, _, _) = fixture(512);
        mem.set_min_free_pages(64);
        let zone = mem.zone(ZoneKind::Normal);
        let slab = Arc::new(SlabCache {
            objects: AtomicUsize::new(10_000),
        });
        mem.register_shrinker(slab.clone());

        // Cache de arquivo limpo e desmapeado: presa fácil.
        for _ in 0..300 {
            let run = mem.allocate(0, GfpFlags::KERNEL).unwrap();
            mem.lru_add(run, 7);
        }
        let _held = drain_to(&mem, 63);

        let survivor = mem.allocate(0, GfpFlags::KERNEL).unwrap();
        assert!(zone.free_pages() >= 32);
        assert!(mem.events.pgsteal_direct.load(Ordering::Relaxed) >= 32);
        assert_eq!(mem.events.allocstall.load(Ordering::Relaxed), 1);
        // A pressão proporcional alcançou o cache auxiliar.
        assert!(mem.events.slabs_scanned.load(Ordering::Relaxed) > 0);
        assert!(slab.objects.load(Ordering::Relaxed) < 10_000);
        drop(survivor);
    }

    fn dual_zone() -> Arc<SystemMemory> {
        let spans = [
            MemorySpan {
                kind: ZoneKind::Dma32,
                range: PfnRange::new(0, 512),
            },
            MemorySpan {
                kind: ZoneKind::Normal,
                range: PfnRange::new(512, 1024),
            },
        ];
        let mem = SystemMemory::new(&spans, HookSet::null());
        mem.free_bootmem(PfnRange::new(0, 1024));
        mem
    }

    /// Enche a zona Normal do nó de duas zonas até 79 livres, com 200
    /// páginas de cache de arquivo no LRU dela.
    fn pressure_normal(mem: &Arc<SystemMemory>) -> Vec<PageRun> {
        mem.zone(ZoneKind::Normal).set_min_watermark(64);
        for _ in 0..200 {
            let run = mem.allocate(0, GfpFlags::KERNEL).unwrap();
            assert!(run.pfn() >= 512);
            mem.lru_add(run, 9);
        }
        let zone = mem.zone(ZoneKind::Normal);
        let mut held = Vec::new();
        while zone.free_pages() > 79 {
            held.push(mem.allocate(0, GfpFlags::KERNEL).unwrap());
        }
        held
    }

    #[test]
    fn local_pressure_spills_to_the_next_zone_by_default() {
        let mem = dual_zone();
        let _held = pressure_normal(&mem);

        // Normal reprovada na marca baixa: a busca desce para a DMA32
        // sem acionar reclaim nenhum.
        let spill = mem.allocate(0, GfpFlags::KERNEL).unwrap();
        assert!(spill.pfn() < 512);
        assert_eq!(mem.zone(ZoneKind::Normal).free_pages(), 79);
        assert_eq!(mem.events.pgalloc_slowpath.load(Ordering::Relaxed), 0);
        assert_eq!(mem.events.allocstall.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn zone_reclaim_keeps_the_allocation_local() {
        let mem = dual_zone();
        mem.set_zone_reclaim(true);
        let _held = pressure_normal(&mem);

        // Com o modo ligado a zona se alivia no lugar e atende local.
        let local = mem.allocate(0, GfpFlags::KERNEL).unwrap();
        assert!(local.pfn() >= 512);
        assert!(mem.zone(ZoneKind::Normal).free_pages() > 79);
        assert!(mem.events.pgsteal_direct.load(Ordering::Relaxed) >= 32);
        assert_eq!(mem.events.pgalloc_slowpath.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn the_second_touch_promotes_to_the_active_list() {
        let (mem, _, _) = fixture(256);
        let zone = mem.zone(ZoneKind::Normal);
        let run = mem.allocate(0, GfpFlags::KERNEL).unwrap();
        let pfn = run.pfn();
        mem.lru_add(run, 5);
        assert_eq!(zone.counters.lru_count(LruKind::InactiveFile), 1);

        mem.mark_accessed(pfn);
        assert!(mem.frames.page(pfn).test(PageFlags::REFERENCED));
        assert_eq!(zone.counters.lru_count(LruKind::ActiveFile), 0);

        mem.mark_accessed(pfn);
        assert!(mem.frames.page(pfn).test(PageFlags::ACTIVE));
        assert!(!mem.frames.page(pfn).test(PageFlags::REFERENCED));
        assert_eq!(zone.counters.lru_count(LruKind::ActiveFile), 1);
        assert_eq!(zone.counters.lru_count(LruKind::InactiveFile), 0);
        assert_eq!(mem.events.pgactivate.load(Ordering::Relaxed), 1);

        // Toques numa página já ativa só rearmam o bit.
        mem.mark_accessed(pfn);
        assert!(mem.frames.page(pfn).test(PageFlags::REFERENCED));
        assert_eq!(mem.events.pgactivate.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn mlock_parks_and_munlock_rescues() {
        let (mem, _, _) = fixture(256);
        let zone = mem.zone(ZoneKind::Normal);
        let run = mem.allocate(0, GfpFlags::KERNEL).unwrap();
        let pfn = run.pfn();
        mem.lru_add(run, 3);

        mem.mlock(pfn);
        assert!(mem.frames.page(pfn).test(PageFlags::UNEVICTABLE));
        assert_eq!(zone.counters.lru_count(LruKind::Unevictable), 1);
        assert_eq!(zone.counters.lru_count(LruKind::InactiveFile), 0);

        mem.munlock(pfn);
        assert!(!mem.frames.page(pfn).test(PageFlags::MLOCKED));
        assert!(!mem.frames.page(pfn).test(PageFlags::UNEVICTABLE));
        assert_eq!(zone.counters.lru_count(LruKind::Unevictable), 0);
        assert_eq!(zone.counters.lru_count(LruKind::InactiveFile), 1);
    }

    #[test]
    fn writeback_completion_rotates_the_tagged_page() {
        let (mem, _, _) = fixture(256);
        let zone = mem.zone(ZoneKind::Normal);
        let a = mem.allocate(0, GfpFlags::KERNEL).unwrap();
        let pfn_a = a.pfn();
        mem.lru_add(a, 4);
        let b = mem.allocate(0, GfpFlags::KERNEL).unwrap();
        let pfn_b = b.pfn();
        mem.lru_add(b, 4);
        // Lista: cabeça b, cauda a.

        // O reclaim deixou b em writeback com a etiqueta de liberação.
        let desc = mem.frames.page(pfn_b);
        desc.set(PageFlags::WRITEBACK);
        desc.set(PageFlags::RECLAIM);
        zone.counters.writeback.fetch_add(1, Ordering::Relaxed);

        mem.end_writeback(pfn_b);
        assert!(!desc.test(PageFlags::WRITEBACK));
        assert!(!desc.test(PageFlags::RECLAIM));
        assert_eq!(zone.counters.writeback.load(Ordering::Relaxed), 0);
        assert_eq!(mem.events.pgrotated.load(Ordering::Relaxed), 1);
        // b girou para a cauda: é a próxima vítima do isolamento.
        let rel_a = (pfn_a - zone.range().start) as u32;
        let rel_b = (pfn_b - zone.range().start) as u32;
        let lru = zone.lru().lock();
        assert_eq!(lru.peek_tail(LruKind::InactiveFile), Some(rel_b));
        assert_eq!(lru.peek_head(LruKind::InactiveFile), Some(rel_a));
    }

    #[test]
    fn rmap_bookkeeping_tracks_the_mappings() {
        let (mem, _, _) = fixture(64);
        let run = mem.allocate(0, GfpFlags::KERNEL).unwrap();
        let pfn = run.pfn();
        assert!(!mem.frames.page(pfn).is_mapped());

        mem.page_mapped(pfn);
        mem.page_mapped(pfn);
        assert_eq!(mem.frames.page(pfn).map_count(), 2);
        mem.page_unmapped(pfn);
        assert_eq!(mem.frames.page(pfn).map_count(), 1);
        mem.page_unmapped(pfn);
        assert!(!mem.frames.page(pfn).is_mapped());
    }

    #[test]
    fn usage_reports_only_populated_zones() {
        let (mem, _, _) = fixture(512);
        let report = mem.usage();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].kind, ZoneKind::Normal);
        assert_eq!(report[0].managed, 512);
        assert_eq!(report[0].free, 512);

        mem.set_min_free_pages(64);
        assert_eq!(mem.usage()[0].wmark_low, 80);

        // Dimensionamento per-CPU da zona: lote mínimo 1, teto 6x.
        assert_eq!(mem.usage()[0].pcp_batch, 1);
        assert_eq!(mem.usage()[0].pcp_high, 6);
        assert_eq!(mem.usage()[0].pcp_parked, 0);
        drop(mem.allocate(0, GfpFlags::KERNEL).unwrap());
        assert_eq!(mem.usage()[0].pcp_parked, 1);

        // Nó saudável: o pedido público de balanceamento não arma nada.
        mem.kick_background_reclaim(0, ZoneKind::Normal);
        mem.run_background_reclaim();
        assert_eq!(mem.events.kswapd_wakeups.load(Ordering::Relaxed), 0);
        assert_eq!(mem.events.pageoutrun.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn out_of_range_parameters_are_rejected() {
        let (mem, _, _) = fixture(64);
        assert!(matches!(
            mem.allocate(MAX_ORDER, GfpFlags::KERNEL),
            Err(MmError::OrderTooLarge)
        ));
        assert!(matches!(
            mem.set_swappiness(201),
            Err(MmError::InvalidParameter)
        ));
        assert!(mem.set_swappiness(100).is_ok());
        assert!(matches!(
            mem.set_claim_order(MAX_ORDER),
            Err(MmError::InvalidParameter)
        ));
        assert!(mem.set_claim_order(0).is_ok());
        assert!(matches!(
            mem.drain_cpu(MAX_CPUS),
            Err(MmError::InvalidParameter)
        ));
        assert_eq!(mem.drain_cpu(0), Ok(0));
    }
}
