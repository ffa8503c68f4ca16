//! # Shrinkers de Caches Auxiliares
//!
//! Caches que vivem fora das listas LRU (dentries, inodes, buffers de
//! protocolo) registram um shrinker e passam a ser espremidos em
//! proporção à pressão sobre as páginas: quem tem muito objeto cede
//! mais, quem declara custo alto de reconstrução (`seeks`) cede menos.
//! O que não fecha um lote inteiro fica anotado como débito e carrega
//! para a próxima passada, então caches pequenos também pagam, só que
//! devagar.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::stats::VmEvents;

/// Custo relativo padrão de repovoar um cache.
pub const DEFAULT_SEEKS: u32 = 2;

/// Objetos pedidos a cada chamada de `scan_objects`.
pub const DEFAULT_BATCH: usize = 128;

/// Um cache encolhível registrado no subsistema.
pub trait Shrinker: Send + Sync {
    /// Nome estável para logs e relatórios.
    fn name(&self) -> &str;

    /// Quantos objetos o cache tem no momento.
    fn count_objects(&self) -> usize;

    /// Tenta descartar até `nr` objetos; retorna quantos realmente
    /// saíram. Nunca deve alocar com espera no caminho.
    fn scan_objects(&self, nr: usize) -> usize;

    /// Custo relativo de reconstruir um objeto descartado.
    fn seeks(&self) -> u32 {
        DEFAULT_SEEKS
    }

    /// Tamanho do lote por chamada.
    fn batch(&self) -> usize {
        DEFAULT_BATCH
    }
}

/// Bilhete devolvido no registro; identifica a entrada para remoção.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShrinkerId(u64);

struct Entry {
    id: u64,
    shrinker: Arc<dyn Shrinker>,
    /// Fração de scan devida e ainda não cobrada.
    debt: usize,
}

// =============================================================================
// REGISTRO
// =============================================================================

/// Registro de shrinkers. O lock cobre a lista durante toda a passada
/// de `shrink_all`; registrar ou remover de dentro de um callback
/// deadlockaria, e é contrato que ninguém o faça.
pub(crate) struct ShrinkerRegistry {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl ShrinkerRegistry {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, shrinker: Arc<dyn Shrinker>) -> ShrinkerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        crate::kdebug!("(PMM) shrinker registrado: {}", shrinker.name());
        self.entries.lock().push(Entry {
            id,
            shrinker,
            debt: 0,
        });
        ShrinkerId(id)
    }

    /// Remove a entrada; o débito pendente morre com ela.
    pub fn unregister(&self, id: ShrinkerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id.0);
        entries.len() != before
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Uma passada sobre todos os shrinkers, proporcional à pressão da
    /// rodada de LRU que acabou de acontecer: `scanned` páginas
    /// examinadas de um universo de `lru_pages`. Retorna o total de
    /// objetos descartados.
    pub fn shrink_all(&self, events: &VmEvents, scanned: usize, lru_pages: usize) -> usize {
        if scanned == 0 {
            return 0;
        }
        let lru_pages = lru_pages.max(1);
        let mut freed_total = 0;

        let mut entries = self.entries.lock();
        for entry in entries.iter_mut() {
            let max_pass = entry.shrinker.count_objects();
            if max_pass == 0 {
                continue;
            }
            let seeks = entry.shrinker.seeks().max(1) as usize;
            let mut delta = (4 * scanned) / seeks;
            delta = delta.saturating_mul(max_pass) / lru_pages;
            entry.debt = entry.debt.saturating_add(delta);

            // Histerese: o débito nunca passa de duas vezes o cache,
            // senão um pico de pressão viraria aniquilação total.
            entry.debt = entry.debt.min(max_pass * 2);

            let batch = entry.shrinker.batch().max(1);
            while entry.debt >= batch {
                entry.debt -= batch;
                let freed = entry.shrinker.scan_objects(batch);
                freed_total += freed;
                events
                    .slabs_scanned
                    .fetch_add(batch as u64, Ordering::Relaxed);
                if freed == 0 {
                    // Cache não cede mais nada; cobrar o resto agora só
                    // queimaria ciclos.
                    break;
                }
            }
        }
        freed_total
    }
}

// =============================================================================
// TESTES
// =============================================================================
