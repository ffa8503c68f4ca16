//! # Tipos de Migração
//!
//! Cada pageblock carrega um rótulo de mobilidade. Alocações agrupadas por
//! mobilidade mantêm regiões contíguas montáveis: uma alocação unmovable
//! dentro de um bloco movable "suja" o bloco inteiro para sempre, então o
//! fallback prefere roubar blocos grandes e reivindicá-los de uma vez.

use static_assertions::const_assert_eq;

use crate::config::{align_down, PAGEBLOCK_ORDER, PAGEBLOCK_PAGES};

/// Rótulo de mobilidade de um pageblock (e das listas livres).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum MigrateType {
    /// Alocações do kernel que nunca podem ser movidas (page tables, DMA)
    Unmovable = 0,
    /// Caches do kernel que um shrinker sabe esvaziar
    Reclaimable = 1,
    /// Páginas de usuário, migráveis por natureza
    Movable = 2,
    /// Pool de emergência sempre presente; último recurso do fallback
    Reserve = 3,
    /// Bloco em quarentena (hot-remove/depuração); nunca alocável
    Isolate = 4,
}

/// Número de tipos de migração (= número de listas por free_area)
pub const MIGRATE_TYPE_COUNT: usize = 5;

/// Os caches per-CPU cobrem apenas os três tipos alocáveis comuns
pub const MIGRATE_PCP_TYPES: usize = 3;

const_assert_eq!(MIGRATE_TYPE_COUNT, MigrateType::ALL.len());

/// Ordem de busca quando a lista do tipo preferido está vazia, por tipo
/// preferido. `Reserve` encerra cada linha: o chamador para ali e tenta a
/// reserva explicitamente como último recurso. Linhas de `Reserve`/`Isolate`
/// nunca são consultadas (nenhuma alocação começa nesses tipos).
pub const FALLBACKS: [[MigrateType; 3]; MIGRATE_TYPE_COUNT] = [
    // Unmovable
    [
        MigrateType::Reclaimable,
        MigrateType::Movable,
        MigrateType::Reserve,
    ],
    // Reclaimable
    [
        MigrateType::Unmovable,
        MigrateType::Movable,
        MigrateType::Reserve,
    ],
    // Movable
    [
        MigrateType::Reclaimable,
        MigrateType::Unmovable,
        MigrateType::Reserve,
    ],
    // Reserve (nunca usado)
    [
        MigrateType::Reserve,
        MigrateType::Reserve,
        MigrateType::Reserve,
    ],
    // Isolate (nunca usado)
    [
        MigrateType::Reserve,
        MigrateType::Reserve,
        MigrateType::Reserve,
    ],
];

impl MigrateType {
    /// Todos os tipos, na ordem dos índices de lista.
    pub const ALL: [MigrateType; 5] = [
        MigrateType::Unmovable,
        MigrateType::Reclaimable,
        MigrateType::Movable,
        MigrateType::Reserve,
        MigrateType::Isolate,
    ];

    /// Nome curto para logs e relatórios.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unmovable => "unmovable",
            Self::Reclaimable => "reclaimable",
            Self::Movable => "movable",
            Self::Reserve => "reserve",
            Self::Isolate => "isolate",
        }
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self as usize
    }

    /// Reconstrói a partir do valor guardado no mapa de pageblocks.
    #[inline]
    pub fn from_u8(v: u8) -> Self {
        debug_assert!((v as usize) < MIGRATE_TYPE_COUNT);
        match v {
            0 => Self::Unmovable,
            1 => Self::Reclaimable,
            2 => Self::Movable,
            3 => Self::Reserve,
            _ => Self::Isolate,
        }
    }

    /// Cadeia de fallback deste tipo (termina em `Reserve`).
    #[inline]
    pub fn fallbacks(self) -> &'static [MigrateType; 3] {
        &FALLBACKS[self.as_usize()]
    }

    /// Tipo elegível para o cache per-CPU?
    #[inline]
    pub fn is_pcp_type(self) -> bool {
        self.as_usize() < MIGRATE_PCP_TYPES
    }
}

/// Índice do pageblock de um PFN relativo à base alinhada da zona.
#[inline]
pub const fn pageblock_index(rel_pfn: usize) -> usize {
    rel_pfn >> PAGEBLOCK_ORDER
}

/// Primeiro PFN relativo do pageblock que contém `rel_pfn`.
#[inline]
pub const fn pageblock_start(rel_pfn: usize) -> usize {
    align_down(rel_pfn, PAGEBLOCK_PAGES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_rows_end_in_reserve() {
        for row in FALLBACKS.iter() {
            assert_eq!(*row.last().unwrap(), MigrateType::Reserve);
        }
    }

    #[test]
    fn fallback_never_revisits_preferred_type() {
        for (idx, row) in FALLBACKS.iter().enumerate().take(MIGRATE_PCP_TYPES) {
            let preferred = MigrateType::from_u8(idx as u8);
            for t in row.iter().filter(|t| **t != MigrateType::Reserve) {
                assert_ne!(*t, preferred);
            }
        }
    }

    #[test]
    fn pageblock_math() {
        assert_eq!(pageblock_index(0), 0);
        assert_eq!(pageblock_index(PAGEBLOCK_PAGES - 1), 0);
        assert_eq!(pageblock_index(PAGEBLOCK_PAGES), 1);
        assert_eq!(pageblock_start(PAGEBLOCK_PAGES + 7), PAGEBLOCK_PAGES);
    }

    #[test]
    fn pcp_covers_common_types_only() {
        assert!(MigrateType::Unmovable.is_pcp_type());
        assert!(MigrateType::Reclaimable.is_pcp_type());
        assert!(MigrateType::Movable.is_pcp_type());
        assert!(!MigrateType::Reserve.is_pcp_type());
        assert!(!MigrateType::Isolate.is_pcp_type());
    }
}
