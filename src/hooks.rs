//! # Ganchos para Colaboradores Externos
//!
//! O alocador depende de serviços que vivem fora dele: contexto de
//! escalonamento, rmap (page tables), backing store (writeback/swap),
//! manutenção de cache de dados e seleção de vítima de OOM. Cada
//! capacidade é um trait object guardado no `SystemMemory`; os testes
//! injetam mocks determinísticos no lugar.

use alloc::sync::Arc;

use crate::gfp::GfpFlags;
use crate::page::MappingId;

// =============================================================================
// RESULTADOS DOS COLABORADORES
// =============================================================================

/// Resposta do rmap sobre referências via page tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageReferences {
    /// PTEs com bit de acesso setado desde o último exame
    pub ptes: u32,
    /// Existe mapeamento executável de arquivo?
    pub exec: bool,
}

/// Resultado de `try_to_unmap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapOutcome {
    /// Todos os mapeamentos removidos
    Done,
    /// Conflito transitório; tentar de novo na próxima rodada
    Busy,
    /// Remover agora arriscaria deadlock; reativar a página
    WouldDeadlock,
    /// Descoberta mlocked no meio do caminho; mover para unevictable
    NewlyMlocked,
}

/// Resultado de um pedido de writeback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// IO submetido; conclusão chega via `end_writeback`
    Submitted,
    /// Backing store congestionado agora
    Blocked,
    /// Falha permanente de IO
    Error,
}

/// Modo de writeback pedido pelo reclaim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritebackMode {
    /// Submeter e seguir em frente (único modo que o reclaim usa)
    Async,
    /// Esperar a conclusão (caminhos de sync/umount, fora deste crate)
    Sync,
}

/// Resultado do abate de vítima de OOM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OomVerdict {
    /// Uma vítima foi morta; vale repetir a alocação
    Killed,
    /// Não há o que matar; a exaustão é terminal
    NoVictim,
}

/// Slot de swap atribuído a uma página anônima.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSlot(pub u32);

// =============================================================================
// TRAITS DE CAPACIDADE
// =============================================================================

/// Contexto de escalonamento: CPU corrente, sinais, esperas.
pub trait SchedHooks: Send + Sync {
    /// CPU em que o chamador está rodando (indexa os caches per-CPU).
    fn current_cpu(&self) -> usize;

    /// Sinal fatal pendente no chamador? Aborta o slow path entre rodadas.
    fn fatal_signal_pending(&self) -> bool {
        false
    }

    /// Espera curta por congestionamento de IO.
    fn congestion_wait(&self, msecs: u64);

    /// Notifica que o kswapd tem trabalho (o embutidor acorda a thread).
    fn kswapd_wakeup(&self);
}

/// Lado das page tables: referências e unmap.
pub trait RmapHooks: Send + Sync {
    /// Colhe e limpa os bits de acesso das PTEs que mapeiam a página.
    fn page_referenced(&self, pfn: usize) -> PageReferences;

    /// Remove a página de todas as page tables.
    fn try_to_unmap(&self, pfn: usize) -> UnmapOutcome;
}

/// Backing store: address spaces, writeback e swap.
pub trait BackingHooks: Send + Sync {
    /// Remove a página do índice do address space dono. O crate já
    /// congelou a contagem de referências; `false` veta (o dono ainda a
    /// quer) e o congelamento é desfeito.
    fn remove_mapping(&self, mapping: MappingId, pfn: usize) -> bool;

    /// Submete writeback de uma página suja.
    fn write_back(&self, pfn: usize, mapping: MappingId, mode: WritebackMode) -> WriteOutcome;

    /// Reserva um slot de swap para uma página anônima.
    fn swap_slot_alloc(&self, pfn: usize) -> Option<SwapSlot>;

    /// Devolve um slot (página reativada ou liberada).
    fn swap_slot_free(&self, slot: SwapSlot);

    /// Há espaço de swap utilizável? Sem swap, páginas anônimas ficam
    /// fora do scan por completo.
    fn swap_enabled(&self) -> bool {
        false
    }
}

/// Manutenção de cache de dados sobre os frames.
pub trait CacheHooks: Send + Sync {
    /// Zera o conteúdo de um bloco (alocação ZERO_FILL).
    fn zero_pages(&self, pfn: usize, count: usize);

    /// Contrato de coerência: a camada de mapeamento virtual deve chamar
    /// isto exatamente uma vez quando a identidade da página muda (novo
    /// dono, novo alias). Os caminhos de alloc/free deste crate nunca
    /// chamam; está aqui porque o contrato pertence à mesma fronteira.
    fn flush_before_reuse(&self, pfn: usize, count: usize);
}

/// Seleção e abate de vítima quando o reclaim não faz progresso.
pub trait OomHooks: Send + Sync {
    fn kill_victim(&self, order: usize, gfp: GfpFlags) -> OomVerdict;
}

// =============================================================================
// CONJUNTO DE GANCHOS
// =============================================================================

/// Bundle com um trait object por capacidade.
#[derive(Clone)]
pub struct HookSet {
    pub sched: Arc<dyn SchedHooks>,
    pub rmap: Arc<dyn RmapHooks>,
    pub backing: Arc<dyn BackingHooks>,
    pub cache: Arc<dyn CacheHooks>,
    pub oom: Arc<dyn OomHooks>,
}

impl HookSet {
    /// Conjunto inerte: CPU 0, sem swap, sem vítimas, esperas viram no-op.
    pub fn null() -> Self {
        let null = Arc::new(NullHooks);
        Self {
            sched: null.clone(),
            rmap: null.clone(),
            backing: null.clone(),
            cache: null.clone(),
            oom: null,
        }
    }
}

/// Implementação inerte de todas as capacidades.
pub struct NullHooks;

impl SchedHooks for NullHooks {
    fn current_cpu(&self) -> usize {
        0
    }

    fn congestion_wait(&self, _msecs: u64) {}

    fn kswapd_wakeup(&self) {}
}

impl RmapHooks for NullHooks {
    fn page_referenced(&self, _pfn: usize) -> PageReferences {
        PageReferences::default()
    }

    fn try_to_unmap(&self, _pfn: usize) -> UnmapOutcome {
        UnmapOutcome::Done
    }
}

impl BackingHooks for NullHooks {
    fn remove_mapping(&self, _mapping: MappingId, _pfn: usize) -> bool {
        true
    }

    fn write_back(&self, _pfn: usize, _mapping: MappingId, _mode: WritebackMode) -> WriteOutcome {
        WriteOutcome::Submitted
    }

    fn swap_slot_alloc(&self, _pfn: usize) -> Option<SwapSlot> {
        None
    }

    fn swap_slot_free(&self, _slot: SwapSlot) {}
}

impl CacheHooks for NullHooks {
    fn zero_pages(&self, _pfn: usize, _count: usize) {}

    fn flush_before_reuse(&self, _pfn: usize, _count: usize) {}
}

impl OomHooks for NullHooks {
    fn kill_victim(&self, _order: usize, _gfp: GfpFlags) -> OomVerdict {
        OomVerdict::NoVictim
    }
}

// =============================================================================
// MOCKS DE TESTE
// =============================================================================

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use alloc::collections::BTreeMap;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use spin::Mutex;

    /// Contexto de escalonamento gravável: CPU ajustável, esperas contadas.
    #[derive(Default)]
    pub struct RecordingSched {
        pub cpu: AtomicUsize,
        pub fatal: AtomicBool,
        pub waits: AtomicU64,
        pub wait_ms: AtomicU64,
        pub wakeups: AtomicU64,
    }

    impl SchedHooks for RecordingSched {
        fn current_cpu(&self) -> usize {
            self.cpu.load(Ordering::Relaxed)
        }

        fn fatal_signal_pending(&self) -> bool {
            self.fatal.load(Ordering::Relaxed)
        }

        fn congestion_wait(&self, msecs: u64) {
            self.waits.fetch_add(1, Ordering::Relaxed);
            self.wait_ms.fetch_add(msecs, Ordering::Relaxed);
        }

        fn kswapd_wakeup(&self) {
            self.wakeups.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Rmap de mentira: referências e resultados de unmap por PFN.
    #[derive(Default)]
    pub struct ScriptedRmap {
        pub referenced: Mutex<BTreeMap<usize, PageReferences>>,
        pub unmap: Mutex<BTreeMap<usize, UnmapOutcome>>,
        pub unmap_calls: Mutex<Vec<usize>>,
    }

    impl ScriptedRmap {
        pub fn set_referenced(&self, pfn: usize, ptes: u32, exec: bool) {
            self.referenced
                .lock()
                .insert(pfn, PageReferences { ptes, exec });
        }

        pub fn set_unmap(&self, pfn: usize, outcome: UnmapOutcome) {
            self.unmap.lock().insert(pfn, outcome);
        }
    }

    impl RmapHooks for ScriptedRmap {
        fn page_referenced(&self, pfn: usize) -> PageReferences {
            // Colher consome os bits de acesso, como no rmap real.
            self.referenced.lock().remove(&pfn).unwrap_or_default()
        }

        fn try_to_unmap(&self, pfn: usize) -> UnmapOutcome {
            self.unmap_calls.lock().push(pfn);
            self.unmap
                .lock()
                .get(&pfn)
                .copied()
                .unwrap_or(UnmapOutcome::Done)
        }
    }

    /// Backing store de mentira: swap contável, writeback roteirizado.
    pub struct ScriptedBacking {
        pub swap_on: AtomicBool,
        pub swap_slots: AtomicUsize,
        pub next_slot: AtomicUsize,
        pub freed_slots: Mutex<Vec<SwapSlot>>,
        pub write_result: Mutex<BTreeMap<usize, WriteOutcome>>,
        pub writes: Mutex<Vec<usize>>,
        pub veto_remove: Mutex<BTreeMap<usize, ()>>,
        pub removed: Mutex<Vec<usize>>,
    }

    impl Default for ScriptedBacking {
        fn default() -> Self {
            Self {
                swap_on: AtomicBool::new(false),
                swap_slots: AtomicUsize::new(0),
                next_slot: AtomicUsize::new(1),
                freed_slots: Mutex::new(Vec::new()),
                write_result: Mutex::new(BTreeMap::new()),
                writes: Mutex::new(Vec::new()),
                veto_remove: Mutex::new(BTreeMap::new()),
                removed: Mutex::new(Vec::new()),
            }
        }
    }

    impl ScriptedBacking {
        pub fn with_swap(slots: usize) -> Self {
            let b = Self::default();
            b.swap_on.store(true, Ordering::Relaxed);
            b.swap_slots.store(slots, Ordering::Relaxed);
            b
        }
    }

    impl BackingHooks for ScriptedBacking {
        fn remove_mapping(&self, _mapping: MappingId, pfn: usize) -> bool {
            if self.veto_remove.lock().contains_key(&pfn) {
                return false;
            }
            self.removed.lock().push(pfn);
            true
        }

        fn write_back(&self, pfn: usize, _mapping: MappingId, _mode: WritebackMode) -> WriteOutcome {
            self.writes.lock().push(pfn);
            self.write_result
                .lock()
                .get(&pfn)
                .copied()
                .unwrap_or(WriteOutcome::Submitted)
        }

        fn swap_slot_alloc(&self, _pfn: usize) -> Option<SwapSlot> {
            let left = self.swap_slots.load(Ordering::Relaxed);
            if !self.swap_on.load(Ordering::Relaxed) || left == 0 {
                return None;
            }
            self.swap_slots.store(left - 1, Ordering::Relaxed);
            let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
            Some(SwapSlot(slot as u32))
        }

        fn swap_slot_free(&self, slot: SwapSlot) {
            self.swap_slots.fetch_add(1, Ordering::Relaxed);
            self.freed_slots.lock().push(slot);
        }

        fn swap_enabled(&self) -> bool {
            self.swap_on.load(Ordering::Relaxed)
        }
    }

    /// Registra os ranges zerados/flushados.
    #[derive(Default)]
    pub struct RecordingCache {
        pub zeroed: Mutex<Vec<(usize, usize)>>,
        pub flushed: Mutex<Vec<(usize, usize)>>,
    }

    impl CacheHooks for RecordingCache {
        fn zero_pages(&self, pfn: usize, count: usize) {
            self.zeroed.lock().push((pfn, count));
        }

        fn flush_before_reuse(&self, pfn: usize, count: usize) {
            self.flushed.lock().push((pfn, count));
        }
    }

    /// OOM killer roteirizado: mata N vezes, depois nega.
    #[derive(Default)]
    pub struct ScriptedOom {
        pub kills_left: AtomicUsize,
        pub kills: AtomicU64,
    }

    impl OomHooks for ScriptedOom {
        fn kill_victim(&self, _order: usize, _gfp: GfpFlags) -> OomVerdict {
            let left = self.kills_left.load(Ordering::Relaxed);
            if left == 0 {
                return OomVerdict::NoVictim;
            }
            self.kills_left.store(left - 1, Ordering::Relaxed);
            self.kills.fetch_add(1, Ordering::Relaxed);
            OomVerdict::Killed
        }
    }
}
