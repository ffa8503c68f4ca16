//! # Balanceamento em Background
//!
//! O kswapd corre atrás da marca alta: acordado quando uma alocação
//! encontra uma zona abaixo da marca baixa, pressiona as listas até
//! todas as zonas elegíveis voltarem a respirar. O crate não possui a
//! thread; o embutidor a cria e chama `run_background_reclaim` quando o
//! gancho `kswapd_wakeup` sinaliza.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::config::{CONGESTION_WAIT_MS, DEF_PRIORITY, SWAP_CLUSTER_MAX, UNRECLAIMABLE_SCAN_FACTOR};
use crate::node::SystemMemory;
use crate::zone::{WatermarkLevel, ZoneKind, ZONE_ALL_UNRECLAIMABLE, ZONE_CONGESTED};

use super::ScanControl;

// =============================================================================
// CONTROLE DE DESPERTAR
// =============================================================================

/// Pedido pendente de balanceamento, armado pelos alocadores e
/// consumido pelo daemon. Edge-triggered: só o primeiro pedido depois
/// de um `take` gera sinal; os demais apenas elevam a ordem alvo.
pub(crate) struct KswapdControl {
    woken: AtomicBool,
    wake_order: AtomicUsize,
    wake_classzone: AtomicUsize,
}

impl KswapdControl {
    pub const fn new() -> Self {
        Self {
            woken: AtomicBool::new(false),
            wake_order: AtomicUsize::new(0),
            wake_classzone: AtomicUsize::new(0),
        }
    }

    /// Arma o pedido. Retorna true se o daemon estava adormecido e
    /// precisa de sinal.
    pub fn request(&self, order: usize, classzone: ZoneKind) -> bool {
        self.wake_order.fetch_max(order, Ordering::Relaxed);
        self.wake_classzone
            .fetch_max(classzone.as_usize(), Ordering::Relaxed);
        !self.woken.swap(true, Ordering::AcqRel)
    }

    /// Consome o pedido pendente, se houver.
    pub fn take(&self) -> Option<(usize, ZoneKind)> {
        if !self.woken.swap(false, Ordering::AcqRel) {
            return None;
        }
        let order = self.wake_order.swap(0, Ordering::Relaxed);
        let class = self.wake_classzone.swap(0, Ordering::Relaxed);
        Some((order, ZoneKind::from_usize(class).unwrap_or(ZoneKind::Movable)))
    }
}

// =============================================================================
// EPISÓDIO DE BALANCEAMENTO
// =============================================================================

/// Alguma zona elegível ainda abaixo da marca alta? Se sim, voltar a
/// dormir seria prematuro.
pub(crate) fn sleeping_prematurely(mem: &SystemMemory, order: usize, classzone: ZoneKind) -> bool {
    for zone in mem.zones_for(classzone) {
        if zone.managed_pages() == 0 || zone.is_all_unreclaimable() {
            continue;
        }
        if !zone.watermark_ok(order, zone.watermark(WatermarkLevel::High), 0) {
            return true;
        }
    }
    false
}

/// Um episódio de balanceamento: pressiona cada zona abaixo da marca
/// alta, da mais alta para a mais baixa na hierarquia, endurecendo a
/// prioridade a cada rodada sem sucesso. Zonas varridas muitas vezes o
/// seu tamanho recuperável sem nada liberar são declaradas
/// irrecuperáveis e saem das contas até alguém liberar páginas.
pub(crate) fn balance_node(mem: &SystemMemory, order: usize, classzone: ZoneKind) -> usize {
    mem.events.pageoutrun.fetch_add(1, Ordering::Relaxed);
    let swap_enabled = mem.hooks.backing.swap_enabled();
    let mut sc = ScanControl::kswapd();

    for priority in (0..=DEF_PRIORITY).rev() {
        sc.priority = priority;
        sc.nr_scanned = 0;
        let mut any_below = false;

        for zone in mem.zones_for(classzone) {
            if zone.managed_pages() == 0 {
                continue;
            }
            if zone.is_all_unreclaimable() && priority != DEF_PRIORITY {
                continue;
            }
            if zone.watermark_ok(order, zone.watermark(WatermarkLevel::High), 0) {
                continue;
            }

            any_below = true;
            super::shrink_zone(mem, zone, &mut sc);

            // Slab no mesmo compasso do scan desta zona.
            let lru_pages = zone.reclaimable_pages(swap_enabled).max(1);
            mem.shrinkers.shrink_all(&mem.events, sc.nr_scanned, lru_pages);

            if !zone.is_all_unreclaimable()
                && zone.counters.pages_scanned.load(Ordering::Relaxed)
                    >= zone.reclaimable_pages(swap_enabled) * UNRECLAIMABLE_SCAN_FACTOR
            {
                zone.flags.set(ZONE_ALL_UNRECLAIMABLE);
                crate::kinfo!(
                    "(KSWAPD) zona {} declarada irrecuperavel",
                    zone.kind().name()
                );
            }
        }

        if !any_below {
            break;
        }
        // Progresso razoável: melhor repetir o episódio do que insistir
        // numa prioridade cada vez mais agressiva.
        if sc.nr_reclaimed >= SWAP_CLUSTER_MAX {
            break;
        }
        if sc.nr_scanned > 0 && priority < DEF_PRIORITY - 2 {
            mem.hooks.sched.congestion_wait(CONGESTION_WAIT_MS);
        }
    }

    // Zona de volta à marca alta respira de novo: derruba o veredito de
    // congestionamento posto pelo reclaim.
    for zone in mem.zones_for(classzone) {
        if zone.managed_pages() == 0 {
            continue;
        }
        if zone.watermark_ok(order, zone.watermark(WatermarkLevel::High), 0) {
            zone.flags.clear(ZONE_CONGESTED);
        }
    }
    sc.nr_reclaimed
}

// =============================================================================
// TESTES
// =============================================================================

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    use super::*;
    use crate::gfp::GfpFlags;
    use crate::hooks::mock::RecordingSched;
    use crate::hooks::HookSet;
    use crate::node::{MemorySpan, SystemMemory};
    use crate::page::PageRun;
    use crate::zone::PfnRange;

    #[test]
    fn wake_request_is_edge_triggered() {
        let ctl = KswapdControl::new();
        assert!(ctl.request(2, ZoneKind::Normal));
        // Pedidos seguintes só elevam a ordem, sem novo sinal.
        assert!(!ctl.request(5, ZoneKind::Dma));
        assert_eq!(ctl.take(), Some((5, ZoneKind::Normal)));
        assert_eq!(ctl.take(), None);
        // Consumido, o próximo pedido volta a sinalizar.
        assert!(ctl.request(0, ZoneKind::Normal));
    }

    fn fixture(pages: usize) -> (Arc<SystemMemory>, Arc<RecordingSched>) {
        let sched = Arc::new(RecordingSched::default());
        let mut hooks = HookSet::null();
        hooks.sched = sched.clone();
        let spans = [MemorySpan {
            kind: ZoneKind::Normal,
            range: PfnRange::new(0, pages),
        }];
        let mem = SystemMemory::new(&spans, hooks);
        mem.free_bootmem(PfnRange::new(0, pages));
        (mem, sched)
    }

    #[test]
    fn wake_skips_nodes_already_above_the_low_mark() {
        let (mem, sched) = fixture(512);
        mem.wake_kswapd(0, ZoneKind::Normal);
        assert_eq!(mem.events.kswapd_wakeups.load(Ordering::Relaxed), 0);
        assert_eq!(sched.wakeups.load(Ordering::Relaxed), 0);

        // Abaixo da marca baixa o pedido arma e sinaliza uma vez só.
        mem.zone(ZoneKind::Normal).set_min_watermark(10_000);
        mem.wake_kswapd(0, ZoneKind::Normal);
        mem.wake_kswapd(0, ZoneKind::Normal);
        assert_eq!(mem.events.kswapd_wakeups.load(Ordering::Relaxed), 1);
        assert_eq!(sched.wakeups.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn balance_refills_the_zone_to_the_high_mark() {
        let (mem, _sched) = fixture(512);
        // Seca a zona e deixa tudo evictável no LRU de arquivo.
        for _ in 0..480 {
            let run = mem.allocate(0, GfpFlags::KERNEL).unwrap();
            mem.lru_add(run, 7);
        }
        let zone = mem.zone(ZoneKind::Normal);
        zone.set_min_watermark(32);
        assert!(zone.free_pages() < zone.watermark(WatermarkLevel::High));

        mem.wake_kswapd(0, ZoneKind::Normal);
        mem.run_background_reclaim();

        assert!(zone.free_pages() >= zone.watermark(WatermarkLevel::High));
        assert!(mem.events.pageoutrun.load(Ordering::Relaxed) >= 1);
        assert!(mem.events.pgscan_kswapd.load(Ordering::Relaxed) > 0);
        assert!(mem.events.pgsteal_kswapd.load(Ordering::Relaxed) > 0);
        assert_eq!(mem.events.kswapd_wakeups.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn balancing_clears_the_congestion_verdict() {
        let (mem, _sched) = fixture(512);
        for _ in 0..480 {
            let run = mem.allocate(0, GfpFlags::KERNEL).unwrap();
            mem.lru_add(run, 7);
        }
        let zone = mem.zone(ZoneKind::Normal);
        zone.set_min_watermark(32);
        // Veredito deixado por um episódio anterior de writeback.
        zone.flags.set(ZONE_CONGESTED);

        mem.wake_kswapd(0, ZoneKind::Normal);
        mem.run_background_reclaim();

        assert!(zone.free_pages() >= zone.watermark(WatermarkLevel::High));
        assert!(!zone.flags.test(ZONE_CONGESTED));
    }

    #[test]
    fn hopeless_zone_is_declared_unreclaimable_and_amnestied_on_free() {
        let (mem, _sched) = fixture(512);
        let mut held: Vec<PageRun> = Vec::new();
        held.push(mem.allocate(1, GfpFlags::KERNEL).unwrap());
        for _ in 0..510 {
            held.push(mem.allocate(0, GfpFlags::KERNEL).unwrap());
        }
        let zone = mem.zone(ZoneKind::Normal);
        assert_eq!(zone.free_pages(), 0);
        zone.set_min_watermark(32);

        // Nada no LRU: não há o que balancear, e o episódio termina.
        mem.wake_kswapd(0, ZoneKind::Normal);
        mem.run_background_reclaim();
        assert!(zone.is_all_unreclaimable());

        // Qualquer devolução ao buddy anistia o veredito.
        held.remove(0);
        assert!(!zone.is_all_unreclaimable());
    }

    #[test]
    fn premature_sleep_ends_when_zones_balance_or_give_up() {
        let (mem, _sched) = fixture(512);
        for _ in 0..480 {
            let run = mem.allocate(0, GfpFlags::KERNEL).unwrap();
            mem.lru_add(run, 7);
        }
        let zone = mem.zone(ZoneKind::Normal);
        zone.set_min_watermark(32);
        assert!(sleeping_prematurely(&mem, 0, ZoneKind::Normal));

        zone.flags.set(ZONE_ALL_UNRECLAIMABLE);
        assert!(!sleeping_prematurely(&mem, 0, ZoneKind::Normal));
    }
}
