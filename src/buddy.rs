//! # Buddy Allocator
//!
//! Blocos livres de `2^ordem` páginas, pareados por XOR do PFN. Cada
//! ordem mantém uma free list por tipo de migração; a fusão de buddies
//! é iterativa e, como `MAX_ORDER - 1` coincide com a ordem do
//! pageblock, nunca atravessa uma fronteira de pageblock.
//!
//! As listas são encadeadas por índice numa arena de elos (sem ponteiros
//! intrusivos, sem `unsafe`). Todo o estado deste módulo vive sob o lock
//! de zona; os descritores espelham membership (`BUDDY` + ordem + lista)
//! para a fusão achar e deslinkar o parceiro.

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::config::{align_up, is_aligned, MAX_ORDER, PAGEBLOCK_ORDER, PAGEBLOCK_PAGES};
use crate::list::{PageLink, PageList};
use crate::migrate::{MigrateType, MIGRATE_TYPE_COUNT};
use crate::page::{FrameTable, PageDescriptor, PageFlags};
use crate::stats::VmEvents;
use crate::zone::{PfnRange, WatermarkLevel, Zone};

// =============================================================================
// ÁREAS LIVRES
// =============================================================================

/// Free lists de uma ordem, segregadas por tipo de migração.
struct FreeArea {
    lists: [PageList; MIGRATE_TYPE_COUNT],
    /// Blocos livres nesta ordem, somando todos os tipos.
    nr_free: usize,
}

impl FreeArea {
    const fn new() -> Self {
        Self {
            lists: [PageList::new(); MIGRATE_TYPE_COUNT],
            nr_free: 0,
        }
    }
}

/// Estado do buddy de uma zona. Guardado por `Zone::free_areas`.
pub(crate) struct FreeAreas {
    areas: [FreeArea; MAX_ORDER],
    /// Arena de elos, indexada por PFN relativo à zona.
    links: Vec<PageLink>,
    /// Total de páginas livres (contagem autoritativa).
    free_pages: usize,
}

impl FreeAreas {
    pub fn new(span: usize) -> Self {
        const AREA: FreeArea = FreeArea::new();
        Self {
            areas: [AREA; MAX_ORDER],
            links: vec![PageLink::detached(); span],
            free_pages: 0,
        }
    }

    pub fn free_pages(&self) -> usize {
        self.free_pages
    }

    /// Blocos livres na ordem, somando todos os tipos.
    pub fn nr_free_order(&self, order: usize) -> usize {
        self.areas[order].nr_free
    }

    /// Comprimento de uma free list específica.
    pub fn list_len(&self, order: usize, mt: MigrateType) -> usize {
        self.areas[order].lists[mt.as_usize()].len()
    }

    pub fn peek_head(&self, order: usize, mt: MigrateType) -> Option<u32> {
        self.areas[order].lists[mt.as_usize()].peek_head()
    }

    pub fn peek_tail(&self, order: usize, mt: MigrateType) -> Option<u32> {
        self.areas[order].lists[mt.as_usize()].peek_tail()
    }

    fn insert_head(&mut self, rel: u32, order: usize, mt: MigrateType) {
        self.areas[order].lists[mt.as_usize()].push_head(&mut self.links, rel);
        self.areas[order].nr_free += 1;
    }

    fn insert_tail(&mut self, rel: u32, order: usize, mt: MigrateType) {
        self.areas[order].lists[mt.as_usize()].push_tail(&mut self.links, rel);
        self.areas[order].nr_free += 1;
    }

    fn remove(&mut self, rel: u32, order: usize, mt: MigrateType) {
        self.areas[order].lists[mt.as_usize()].remove(&mut self.links, rel);
        self.areas[order].nr_free -= 1;
    }

    fn pop_head(&mut self, order: usize, mt: MigrateType) -> Option<u32> {
        let rel = self.areas[order].lists[mt.as_usize()].pop_head(&mut self.links)?;
        self.areas[order].nr_free -= 1;
        Some(rel)
    }

    fn credit_pages(&mut self, pages: usize) {
        self.free_pages += pages;
    }

    fn debit_pages(&mut self, pages: usize) {
        debug_assert!(self.free_pages >= pages);
        self.free_pages -= pages;
    }

    /// Enfileira um bloco sem tocar descritores. Só para montar cenários
    /// de teste; o caminho real passa por `free_one_locked`.
    #[cfg(test)]
    pub fn seed_block(&mut self, rel: u32, order: usize, mt: MigrateType) {
        self.insert_tail(rel, order, mt);
        self.credit_pages(1 << order);
    }
}

// =============================================================================
// PRIMITIVAS (com o lock de zona em mãos)
// =============================================================================

/// O descritor marca um bloco livre desta ordem?
fn page_is_buddy(desc: &PageDescriptor, order: usize) -> bool {
    desc.test(PageFlags::BUDDY) && desc.buddy_order() == order
}

/// Reparte um bloco de `high` até `low`, devolvendo as metades superiores
/// às listas. A metade inferior (em `rel`) fica com o chamador.
fn expand(
    areas: &mut FreeAreas,
    frames: &FrameTable,
    zone: &Zone,
    rel: u32,
    low: usize,
    high: usize,
    mt: MigrateType,
) {
    let base = zone.range().start;
    let mut order = high;
    while order > low {
        order -= 1;
        let buddy_rel = rel + (1u32 << order);
        let desc = frames.page(base + buddy_rel as usize);
        desc.set(PageFlags::BUDDY);
        desc.set_buddy_info(order, mt);
        areas.insert_head(buddy_rel, order, mt);
    }
}

/// Menor bloco disponível do tipo pedido, repartindo se necessário.
fn rmqueue_smallest(
    areas: &mut FreeAreas,
    frames: &FrameTable,
    zone: &Zone,
    order: usize,
    mt: MigrateType,
) -> Option<u32> {
    for current in order..MAX_ORDER {
        let Some(rel) = areas.pop_head(current, mt) else {
            continue;
        };
        let desc = frames.page(zone.range().start + rel as usize);
        desc.clear(PageFlags::BUDDY);
        desc.set_private(0);
        expand(areas, frames, zone, rel, order, current, mt);
        return Some(rel);
    }
    None
}

/// Move os blocos livres de `[start, end)` para as listas de `dest`.
/// Devolve quantas páginas foram encontradas livres no intervalo.
///
/// Runs de tipos diferentes nunca se fundem (o tipo é invariante do
/// run); quando a mudança de tipo junta dois ex-vizinhos incompatíveis
/// na mesma lista, a reinserção via `free_one_locked` funde na hora.
fn move_freepages(
    areas: &mut FreeAreas,
    frames: &FrameTable,
    zone: &Zone,
    start: usize,
    end: usize,
    dest: MigrateType,
) -> usize {
    let base = zone.range().start;
    let mut pfn = start;
    let mut moved = 0;
    while pfn < end {
        if !zone.contains(pfn) {
            pfn += 1;
            continue;
        }
        let desc = frames.page(pfn);
        if !desc.test(PageFlags::BUDDY) {
            pfn += 1;
            continue;
        }
        let order = desc.buddy_order();
        let src = desc.buddy_migratetype();
        if src != dest {
            areas.remove((pfn - base) as u32, order, src);
            desc.clear(PageFlags::BUDDY);
            desc.set_private(0);
            free_one_locked(areas, frames, zone, pfn, order, dest);
        }
        moved += 1 << order;
        pfn += 1 << order;
    }
    moved
}

/// Variante recortada ao pageblock que contém `pfn`.
fn move_freepages_block(
    areas: &mut FreeAreas,
    frames: &FrameTable,
    zone: &Zone,
    pfn: usize,
    dest: MigrateType,
) -> usize {
    let start = zone.pageblock_start(pfn);
    let end = core::cmp::min(start + PAGEBLOCK_PAGES, zone.range().end);
    move_freepages(areas, frames, zone, start, end, dest)
}

/// Transfere a posse de todos os pageblocks cobertos por um bloco de
/// ordem >= PAGEBLOCK_ORDER.
fn change_pageblock_range(zone: &Zone, start: usize, order: usize, mt: MigrateType) {
    let blocks = 1usize << (order - PAGEBLOCK_ORDER);
    for b in 0..blocks {
        zone.set_pageblock_type(start + (b << PAGEBLOCK_ORDER), mt);
    }
}

/// Rouba da tabela de fallbacks quando as listas do tipo pedido secaram.
///
/// Percorre da MAIOR ordem para a menor: roubar um bloco grande de uma
/// vez fragmenta menos do que beliscar blocos pequenos repetidamente. Um
/// roubo a partir do limiar de claim tenta levar o pageblock inteiro
/// (re-tipando-o se mais da metade estava livre); pedidos Reclaimable
/// agrupam agressivamente e movem as sobras sempre.
fn rmqueue_fallback(
    areas: &mut FreeAreas,
    frames: &FrameTable,
    zone: &Zone,
    events: &VmEvents,
    order: usize,
    start_mt: MigrateType,
    claim_order: usize,
) -> Option<u32> {
    let base = zone.range().start;
    for current in (order..MAX_ORDER).rev() {
        for &fallback in start_mt.fallbacks() {
            if fallback == MigrateType::Reserve {
                // Reserve não é alvo de roubo; é a retentativa final.
                break;
            }
            let Some(rel) = areas.pop_head(current, fallback) else {
                continue;
            };
            events.pgfallback.fetch_add(1, Ordering::Relaxed);

            let pfn = base + rel as usize;
            let desc = frames.page(pfn);
            desc.clear(PageFlags::BUDDY);
            desc.set_private(0);

            let mut list_mt = fallback;
            if current >= claim_order || start_mt == MigrateType::Reclaimable {
                let moved = move_freepages_block(areas, frames, zone, pfn, start_mt);
                if moved + (1 << current) >= (1 << (PAGEBLOCK_ORDER - 1)) {
                    zone.set_pageblock_type(pfn, start_mt);
                    events.pgblock_claims.fetch_add(1, Ordering::Relaxed);
                }
                list_mt = start_mt;
            }
            if current >= PAGEBLOCK_ORDER {
                change_pageblock_range(zone, pfn, current, start_mt);
            }
            expand(areas, frames, zone, rel, order, current, list_mt);
            return Some(rel);
        }
    }
    None
}

/// Saque completo: tipo pedido, depois fallbacks, por fim a reserva.
fn rmqueue_any(
    areas: &mut FreeAreas,
    frames: &FrameTable,
    zone: &Zone,
    events: &VmEvents,
    order: usize,
    mt: MigrateType,
    claim_order: usize,
) -> Option<u32> {
    let mut mt = mt;
    loop {
        if let Some(rel) = rmqueue_smallest(areas, frames, zone, order, mt) {
            return Some(rel);
        }
        if mt == MigrateType::Reserve {
            return None;
        }
        if let Some(rel) = rmqueue_fallback(areas, frames, zone, events, order, mt, claim_order) {
            return Some(rel);
        }
        mt = MigrateType::Reserve;
    }
}

/// Devolve um bloco às listas, fundindo com o buddy enquanto der.
/// A fusão exige que o buddy esteja na MESMA lista: o tipo de migração
/// é invariante do run, nunca diluído por coalescência.
fn free_one_locked(
    areas: &mut FreeAreas,
    frames: &FrameTable,
    zone: &Zone,
    pfn: usize,
    order: usize,
    mt: MigrateType,
) {
    let base = zone.range().start;
    let mut pfn = pfn;
    let mut order = order;

    while order < MAX_ORDER - 1 {
        let buddy_pfn = pfn ^ (1 << order);
        if !zone.contains(buddy_pfn) {
            break;
        }
        let buddy = frames.page(buddy_pfn);
        if !page_is_buddy(buddy, order) || buddy.buddy_migratetype() != mt {
            break;
        }
        areas.remove((buddy_pfn - base) as u32, order, mt);
        buddy.clear(PageFlags::BUDDY);
        buddy.set_private(0);
        pfn &= !(1usize << order);
        order += 1;
    }

    let desc = frames.page(pfn);
    desc.set(PageFlags::BUDDY);
    desc.set_buddy_info(order, mt);
    let rel = (pfn - base) as u32;

    // Se o buddy do bloco pai já está livre, a próxima liberação vizinha
    // vai fundir este bloco de novo; estacionar na cauda evita que ele
    // seja realocado no meio tempo.
    if order < MAX_ORDER - 2 {
        let parent = pfn & !(1usize << order);
        let higher_buddy = parent ^ (1 << (order + 1));
        if zone.contains(higher_buddy) {
            let hb = frames.page(higher_buddy);
            if page_is_buddy(hb, order + 1) && hb.buddy_migratetype() == mt {
                areas.insert_tail(rel, order, mt);
                return;
            }
        }
    }
    areas.insert_head(rel, order, mt);
}

// =============================================================================
// PONTOS DE ENTRADA (adquirem o lock de zona)
// =============================================================================

/// Retira um bloco de `2^order` páginas. A cabeça sai com ref_count 1.
pub(crate) fn rmqueue(
    zone: &Zone,
    frames: &FrameTable,
    events: &VmEvents,
    order: usize,
    mt: MigrateType,
    claim_order: usize,
) -> Option<usize> {
    let mut areas = zone.free_areas().lock();
    let rel = rmqueue_any(&mut areas, frames, zone, events, order, mt, claim_order)?;
    areas.debit_pages(1 << order);
    zone.counters
        .free_pages
        .store(areas.free_pages(), Ordering::Relaxed);
    drop(areas);

    let pfn = zone.range().start + rel as usize;
    frames.page(pfn).set_ref_count(1);
    Some(pfn)
}

/// Saque em lote de páginas de ordem 0 para reabastecer um cache
/// per-CPU, tudo sob uma única aquisição do lock.
pub(crate) fn rmqueue_bulk(
    zone: &Zone,
    frames: &FrameTable,
    events: &VmEvents,
    count: usize,
    mt: MigrateType,
    claim_order: usize,
    out: &mut VecDeque<usize>,
) -> usize {
    let mut areas = zone.free_areas().lock();
    let mut got = 0;
    for _ in 0..count {
        let Some(rel) = rmqueue_any(&mut areas, frames, zone, events, 0, mt, claim_order) else {
            break;
        };
        out.push_back(zone.range().start + rel as usize);
        got += 1;
    }
    areas.debit_pages(got);
    zone.counters
        .free_pages
        .store(areas.free_pages(), Ordering::Relaxed);
    got
}

/// Devolve um bloco ao buddy. O descritor-cabeça já deve estar limpo
/// (ref_count 0, flags zeradas); o tipo de destino é o do pageblock
/// NESTE momento, não o da alocação.
pub(crate) fn free_block(zone: &Zone, frames: &FrameTable, pfn: usize, order: usize) {
    debug_assert_eq!(frames.page(pfn).ref_count(), 0);
    debug_assert!(is_aligned(pfn, 1 << order), "bloco fora do alinhamento da ordem");
    let mt = zone.pageblock_type(pfn);
    let mut areas = zone.free_areas().lock();
    free_one_locked(&mut areas, frames, zone, pfn, order, mt);
    areas.credit_pages(1 << order);
    zone.counters
        .free_pages
        .store(areas.free_pages(), Ordering::Relaxed);
    drop(areas);
    zone.note_pages_freed();
}

/// Devolução em lote de páginas de ordem 0 (dreno de cache per-CPU).
pub(crate) fn free_bulk(
    zone: &Zone,
    frames: &FrameTable,
    pfns: impl IntoIterator<Item = usize>,
) -> usize {
    let mut areas = zone.free_areas().lock();
    let mut freed = 0;
    for pfn in pfns {
        let mt = zone.pageblock_type(pfn);
        free_one_locked(&mut areas, frames, zone, pfn, 0, mt);
        freed += 1;
    }
    areas.credit_pages(freed);
    zone.counters
        .free_pages
        .store(areas.free_pages(), Ordering::Relaxed);
    drop(areas);
    if freed > 0 {
        zone.note_pages_freed();
    }
    freed
}

/// Entrega um intervalo do bootstrap ao buddy, nos maiores blocos
/// alinhados que couberem. Devolve quantas páginas entraram.
pub(crate) fn free_boot_range(zone: &Zone, frames: &FrameTable, range: PfnRange) -> usize {
    debug_assert!(range.start >= zone.range().start && range.end <= zone.range().end);
    let mut areas = zone.free_areas().lock();
    let mut pfn = range.start;
    let mut freed = 0;
    while pfn < range.end {
        let mut order = core::cmp::min(pfn.trailing_zeros() as usize, MAX_ORDER - 1);
        while pfn + (1 << order) > range.end {
            order -= 1;
        }
        for p in pfn..pfn + (1 << order) {
            let desc = frames.page(p);
            debug_assert!(desc.test(PageFlags::RESERVED), "página liberada duas vezes");
            desc.reset_flags(PageFlags::empty());
        }
        let mt = zone.pageblock_type(pfn);
        free_one_locked(&mut areas, frames, zone, pfn, order, mt);
        freed += 1 << order;
        pfn += 1 << order;
    }
    areas.credit_pages(freed);
    zone.counters
        .free_pages
        .store(areas.free_pages(), Ordering::Relaxed);
    drop(areas);
    zone.grow_managed(freed);
    zone.note_pages_freed();
    freed
}

/// Reserva pageblocks próximos ao início da zona para `MIGRATE_RESERVE`,
/// na proporção da marca d'água mínima. Chamado a cada recálculo de
/// marcas; devolve blocos excedentes ao pool Movable.
pub(crate) fn setup_migrate_reserve(zone: &Zone, frames: &FrameTable) {
    let min = zone.watermark(WatermarkLevel::Min);
    let mut wanted = align_up(min, PAGEBLOCK_PAGES) >> PAGEBLOCK_ORDER;
    let range = zone.range();
    let mut areas = zone.free_areas().lock();

    let mut pfn = zone.pageblock_start(range.start);
    while pfn < range.end {
        let rep = core::cmp::max(pfn, range.start);
        let end = core::cmp::min(pfn + PAGEBLOCK_PAGES, range.end);
        let bt = zone.pageblock_type(rep);
        if wanted > 0 {
            match bt {
                MigrateType::Reserve => wanted -= 1,
                MigrateType::Movable => {
                    zone.set_pageblock_type(rep, MigrateType::Reserve);
                    move_freepages(&mut areas, frames, zone, rep, end, MigrateType::Reserve);
                    wanted -= 1;
                }
                _ => {}
            }
        } else if bt == MigrateType::Reserve {
            zone.set_pageblock_type(rep, MigrateType::Movable);
            move_freepages(&mut areas, frames, zone, rep, end, MigrateType::Movable);
        }
        pfn += PAGEBLOCK_PAGES;
    }
}

// =============================================================================
// TESTES
// =============================================================================
