//! # Lista Duplamente Encadeada por Índice
//!
//! As listas livres do buddy e as listas LRU encadeiam páginas pelos seus
//! índices relativos à zona, com os elos guardados numa arena separada (um
//! slot por página). Nada de ponteiros crus: remoção O(1) de qualquer
//! posição, sem unsafe, e a arena inteira vive sob o mesmo lock que a lista.
//!
//! Contrato: o chamador só passa índices que pertencem à lista (a
//! descritora de página diz em qual lista a página está). `remove` de um
//! índice que não é membro corrompe a estrutura, como em qualquer lista
//! intrusiva.

/// Índice nulo (fim de lista / slot desencadeado)
pub const NIL: u32 = u32::MAX;

/// Elos de uma página na arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLink {
    prev: u32,
    next: u32,
}

impl PageLink {
    pub const fn detached() -> Self {
        Self {
            prev: NIL,
            next: NIL,
        }
    }
}

impl Default for PageLink {
    fn default() -> Self {
        Self::detached()
    }
}

/// Cabeça de lista: head/tail/len. Os elos ficam na arena do chamador.
#[derive(Debug, Clone, Copy)]
pub struct PageList {
    head: u32,
    tail: u32,
    len: usize,
}

impl PageList {
    pub const fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn peek_head(&self) -> Option<u32> {
        if self.head == NIL {
            None
        } else {
            Some(self.head)
        }
    }

    #[inline]
    pub fn peek_tail(&self) -> Option<u32> {
        if self.tail == NIL {
            None
        } else {
            Some(self.tail)
        }
    }

    /// Insere no topo (páginas quentes: próximo pop devolve esta).
    pub fn push_head(&mut self, links: &mut [PageLink], idx: u32) {
        debug_assert_eq!(links[idx as usize], PageLink::detached());
        links[idx as usize] = PageLink {
            prev: NIL,
            next: self.head,
        };
        if self.head != NIL {
            links[self.head as usize].prev = idx;
        } else {
            self.tail = idx;
        }
        self.head = idx;
        self.len += 1;
    }

    /// Insere na cauda (páginas frias / candidatas a coalescer de novo).
    pub fn push_tail(&mut self, links: &mut [PageLink], idx: u32) {
        debug_assert_eq!(links[idx as usize], PageLink::detached());
        links[idx as usize] = PageLink {
            prev: self.tail,
            next: NIL,
        };
        if self.tail != NIL {
            links[self.tail as usize].next = idx;
        } else {
            self.head = idx;
        }
        self.tail = idx;
        self.len += 1;
    }

    pub fn pop_head(&mut self, links: &mut [PageLink]) -> Option<u32> {
        let idx = self.peek_head()?;
        self.remove(links, idx);
        Some(idx)
    }

    pub fn pop_tail(&mut self, links: &mut [PageLink]) -> Option<u32> {
        let idx = self.peek_tail()?;
        self.remove(links, idx);
        Some(idx)
    }

    /// Remove um membro arbitrário. O slot volta a `detached`.
    pub fn remove(&mut self, links: &mut [PageLink], idx: u32) {
        let link = links[idx as usize];
        debug_assert!(self.len > 0);

        if link.prev != NIL {
            links[link.prev as usize].next = link.next;
        } else {
            debug_assert_eq!(self.head, idx);
            self.head = link.next;
        }
        if link.next != NIL {
            links[link.next as usize].prev = link.prev;
        } else {
            debug_assert_eq!(self.tail, idx);
            self.tail = link.prev;
        }

        links[idx as usize] = PageLink::detached();
        self.len -= 1;
    }

    /// Itera do topo para a cauda.
    pub fn iter<'a>(&self, links: &'a [PageLink]) -> PageListIter<'a> {
        PageListIter {
            links,
            cursor: self.head,
            forward: true,
        }
    }

    /// Itera da cauda para o topo (ordem de scan do reclaim).
    pub fn iter_rev<'a>(&self, links: &'a [PageLink]) -> PageListIter<'a> {
        PageListIter {
            links,
            cursor: self.tail,
            forward: false,
        }
    }
}

impl Default for PageList {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PageListIter<'a> {
    links: &'a [PageLink],
    cursor: u32,
    forward: bool,
}

impl<'a> Iterator for PageListIter<'a> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.cursor == NIL {
            return None;
        }
        let idx = self.cursor;
        let link = self.links[idx as usize];
        self.cursor = if self.forward { link.next } else { link.prev };
        Some(idx)
    }
}
