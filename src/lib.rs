//! Forge MM.
//!
//! O subsistema de memória física do Forge como biblioteca `no_std`:
//! buddy com tipos de migração, estoques per-CPU, marcas d'água com
//! proteção de lowmem, slow path com OOM, reclaim direto e de
//! background, e shrinkers para os caches auxiliares.
//!
//! O kernel embutidor fornece o mundo exterior via [`hooks::HookSet`]
//! (scheduler, rmap, backing store, manutenção de cache) e conversa com
//! o subsistema através de um [`node::SystemMemory`].

#![no_std]

// Alocação dinâmica (necessária para Vec/Arc; o heap é do embutidor)
extern crate alloc;

// --- Fundamentos ---
pub mod config; // Constantes de geometria e política
pub mod error; // MmError / MmResult
pub mod logging; // Macros kerror!..ktrace! sobre a fachada `log`
pub mod stats; // Contadores de eventos (estilo vmstat)

// --- Descritores ---
pub mod gfp; // Flags de requisição de alocação
pub mod list; // Lista encadeada por índice (arena por zona)
pub mod migrate; // Tipos de migração e tabela de fallback
pub mod page; // Tabela de frames, descritores, handle RAII
pub mod zone; // Zonas, marcas d'água, contadores por zona

// --- Alocador ---
pub mod buddy; // Pares, divisão, fusão, bootmem
pub mod node; // O nó: topologia, tunables, superfície pública
pub mod page_alloc; // Admissão por marca d'água e slow path
pub mod pcp; // Estoques de ordem 0 por CPU

// --- Reclaim ---
pub mod oom; // Serialização de episódios OOM
pub mod reclaim; // Scan do LRU, kswapd, throttle da reserva
pub mod shrinker; // Pressão proporcional nos caches auxiliares

// --- Colaboradores externos ---
pub mod hooks;

#[cfg(feature = "self_test")]
pub mod selftest;

// Re-exportar a superfície de uso diário no topo do crate
pub use crate::error::{MmError, MmResult};
pub use crate::gfp::GfpFlags;
pub use crate::hooks::HookSet;
pub use crate::node::{MemorySpan, SystemMemory};
pub use crate::page::{MappingId, PageRun, NO_MAPPING};
pub use crate::shrinker::{Shrinker, ShrinkerId};
pub use crate::zone::{PfnRange, ZoneKind, ZoneUsage};
