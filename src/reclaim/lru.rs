//! # Listas LRU por Zona
//!
//! Cinco listas por zona: inativa/ativa × anônima/arquivo, mais a
//! unevictable. Os nós são índices relativos à zona ligados numa arena,
//! como nas free lists do buddy; o lock de LRU da zona guarda tudo,
//! inclusive as estatísticas rotated/scanned que alimentam o cálculo de
//! proporção de scan.

use alloc::vec::Vec;

use crate::list::{PageLink, PageList};
use crate::page::{PageDescriptor, PageFlags};

// =============================================================================
// IDENTIDADE DAS LISTAS
// =============================================================================

/// As cinco listas LRU de uma zona.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LruKind {
    InactiveAnon = 0,
    ActiveAnon = 1,
    InactiveFile = 2,
    ActiveFile = 3,
    Unevictable = 4,
}

pub const LRU_KIND_COUNT: usize = 5;

/// Listas que o reclaim examina (todas menos a unevictable).
pub const LRU_EVICTABLE: [LruKind; 4] = [
    LruKind::InactiveAnon,
    LruKind::ActiveAnon,
    LruKind::InactiveFile,
    LruKind::ActiveFile,
];

impl LruKind {
    pub const ALL: [LruKind; LRU_KIND_COUNT] = [
        LruKind::InactiveAnon,
        LruKind::ActiveAnon,
        LruKind::InactiveFile,
        LruKind::ActiveFile,
        LruKind::Unevictable,
    ];

    #[inline]
    pub fn as_usize(self) -> usize {
        self as usize
    }

    pub fn is_active(self) -> bool {
        matches!(self, LruKind::ActiveAnon | LruKind::ActiveFile)
    }

    pub fn is_file(self) -> bool {
        matches!(self, LruKind::InactiveFile | LruKind::ActiveFile)
    }

    /// Par (inativa, ativa) de uma classe de backing.
    pub fn pair(file: bool) -> (LruKind, LruKind) {
        if file {
            (LruKind::InactiveFile, LruKind::ActiveFile)
        } else {
            (LruKind::InactiveAnon, LruKind::ActiveAnon)
        }
    }

    /// Lista a que uma página pertence, pelo estado das flags.
    pub fn for_page(desc: &PageDescriptor) -> LruKind {
        if desc.test(PageFlags::UNEVICTABLE) {
            return LruKind::Unevictable;
        }
        match (desc.is_anon(), desc.test(PageFlags::ACTIVE)) {
            (true, true) => LruKind::ActiveAnon,
            (true, false) => LruKind::InactiveAnon,
            (false, true) => LruKind::ActiveFile,
            (false, false) => LruKind::InactiveFile,
        }
    }
}

/// Índice das estatísticas rotated/scanned: 0 = anon, 1 = file.
#[inline]
pub(crate) fn stat_index(file: bool) -> usize {
    file as usize
}

// =============================================================================
// CONJUNTO LRU DE UMA ZONA
// =============================================================================

/// Listas LRU de uma zona com a arena de links compartilhada.
/// Protegido pelo lock de LRU da zona, nunca pelo lock do buddy.
pub(crate) struct LruSet {
    lists: [PageList; LRU_KIND_COUNT],
    links: Vec<PageLink>,
    /// Páginas reativadas por classe desde o último decaimento
    pub recent_rotated: [usize; 2],
    /// Páginas examinadas por classe desde o último decaimento
    pub recent_scanned: [usize; 2],
    /// Resto de scan acumulado por lista até fechar um lote
    pub saved_scan: [usize; LRU_KIND_COUNT],
}

impl LruSet {
    pub fn new(span: usize) -> Self {
        let mut links = Vec::new();
        links.resize(span, PageLink::detached());
        Self {
            lists: [PageList::new(); LRU_KIND_COUNT],
            links,
            recent_rotated: [0; 2],
            recent_scanned: [0; 2],
            saved_scan: [0; LRU_KIND_COUNT],
        }
    }

    pub fn len(&self, kind: LruKind) -> usize {
        self.lists[kind.as_usize()].len()
    }

    /// Entrada pela cabeça: páginas recém-chegadas ou promovidas.
    pub fn push_head(&mut self, rel: u32, kind: LruKind) {
        self.lists[kind.as_usize()].push_head(&mut self.links, rel);
    }

    /// Entrada pela cauda: devolução sem rejuvenescer.
    pub fn push_tail(&mut self, rel: u32, kind: LruKind) {
        self.lists[kind.as_usize()].push_tail(&mut self.links, rel);
    }

    /// Saída pela cauda: o candidato mais frio primeiro.
    pub fn pop_tail(&mut self, kind: LruKind) -> Option<u32> {
        self.lists[kind.as_usize()].pop_tail(&mut self.links)
    }

    pub fn remove(&mut self, rel: u32, kind: LruKind) {
        self.lists[kind.as_usize()].remove(&mut self.links, rel);
    }

    #[cfg(test)]
    pub fn peek_head(&self, kind: LruKind) -> Option<u32> {
        self.lists[kind.as_usize()].peek_head()
    }

    #[cfg(test)]
    pub fn peek_tail(&self, kind: LruKind) -> Option<u32> {
        self.lists[kind.as_usize()].peek_tail()
    }
}

// =============================================================================
// TESTES
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_flags_decide_the_list() {
        let desc = PageDescriptor::new();
        desc.reset_flags(PageFlags::empty());
        assert_eq!(LruKind::for_page(&desc), LruKind::InactiveFile);

        desc.set(PageFlags::ACTIVE);
        assert_eq!(LruKind::for_page(&desc), LruKind::ActiveFile);

        desc.set(PageFlags::SWAP_BACKED);
        assert_eq!(LruKind::for_page(&desc), LruKind::ActiveAnon);

        desc.clear(PageFlags::ACTIVE);
        assert_eq!(LruKind::for_page(&desc), LruKind::InactiveAnon);

        // Unevictable vence qualquer outra combinação.
        desc.set(PageFlags::UNEVICTABLE | PageFlags::ACTIVE);
        assert_eq!(LruKind::for_page(&desc), LruKind::Unevictable);
    }

    #[test]
    fn tail_yields_the_oldest_entry() {
        let mut lru = LruSet::new(16);
        lru.push_head(1, LruKind::InactiveFile);
        lru.push_head(2, LruKind::InactiveFile);
        lru.push_head(3, LruKind::InactiveFile);
        assert_eq!(lru.len(LruKind::InactiveFile), 3);

        assert_eq!(lru.pop_tail(LruKind::InactiveFile), Some(1));
        assert_eq!(lru.pop_tail(LruKind::InactiveFile), Some(2));
        assert_eq!(lru.pop_tail(LruKind::InactiveFile), Some(3));
        assert_eq!(lru.pop_tail(LruKind::InactiveFile), None);
    }

    #[test]
    fn tail_reentry_keeps_a_page_cold() {
        let mut lru = LruSet::new(16);
        lru.push_head(1, LruKind::InactiveAnon);
        lru.push_head(2, LruKind::InactiveAnon);
        // Devolvida pela cauda, 1 continua sendo a próxima candidata.
        let rel = lru.pop_tail(LruKind::InactiveAnon).unwrap();
        lru.push_tail(rel, LruKind::InactiveAnon);
        assert_eq!(lru.pop_tail(LruKind::InactiveAnon), Some(1));
    }

    #[test]
    fn lists_are_independent() {
        let mut lru = LruSet::new(16);
        lru.push_head(4, LruKind::ActiveFile);
        lru.push_head(5, LruKind::Unevictable);
        lru.remove(4, LruKind::ActiveFile);
        assert_eq!(lru.len(LruKind::ActiveFile), 0);
        assert_eq!(lru.len(LruKind::Unevictable), 1);
    }
}
