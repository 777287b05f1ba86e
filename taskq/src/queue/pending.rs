use crate::task::Task;
use slab::Slab;

#[derive(Debug)]
struct Node {
    task: Task,
    next: Option<usize>,
}

/// Tasks waiting to run, ordered by non-increasing priority and FIFO among
/// equal priorities.
///
/// Nodes live in a slab, links are slab keys. Appending behind a tail of equal
/// or higher priority is O(1). Inserting ahead of the tail scans forward from
/// `hint`, the last such insertion point, when it is still a valid start,
/// otherwise from the head. This keeps a stream of same-priority tasks
/// interrupted by the occasional urgent one cheap.
#[derive(Debug, Default)]
pub(crate) struct PendingList {
    nodes: Slab<Node>,
    head: Option<usize>,
    tail: Option<usize>,

    // Invalidated whenever the node it points to leaves the list, slab keys are
    // re-used.
    hint: Option<usize>,
}

impl PendingList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    fn priority(&self, key: usize) -> u8 {
        self.nodes[key].task.priority()
    }

    /// Inserts `task` behind every task of equal or higher priority.
    pub(crate) fn insert(&mut self, task: Task) {
        let priority = task.priority();

        match self.tail {
            Some(tail) if self.priority(tail) < priority => {
                let key = self.nodes.insert(Node { task, next: None });
                self.insert_ordered(key, priority);
            }
            _ => self.push_back(task),
        }
    }

    /// Appends a barrier at the tail regardless of priority and makes it the
    /// hint. Insertions that go through the hint land behind it, a later
    /// insert that misses the hint is ordered from the head and may pass it.
    pub(crate) fn push_barrier(&mut self, task: Task) {
        self.push_back(task);
        self.hint = self.tail;
    }

    fn push_back(&mut self, task: Task) {
        let key = self.nodes.insert(Node { task, next: None });

        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);
    }

    fn insert_ordered(&mut self, key: usize, priority: u8) {
        let mut prev = self.hint.filter(|&h| self.priority(h) >= priority);
        let mut cursor = match prev {
            Some(p) => self.nodes[p].next,
            None => self.head,
        };

        while let Some(c) = cursor {
            if self.priority(c) < priority {
                break;
            }
            prev = Some(c);
            cursor = self.nodes[c].next;
        }

        // The tail has a lower priority, so `cursor` stopped on a node and the
        // tail is unchanged.
        debug_assert!(cursor.is_some());
        self.nodes[key].next = cursor;

        match prev {
            Some(p) => self.nodes[p].next = Some(key),
            None => self.head = Some(key),
        }

        self.hint = Some(key);
    }

    /// Removes the highest priority, oldest task.
    pub(crate) fn pop_front(&mut self) -> Option<Task> {
        let key = self.head?;
        let node = self.nodes.remove(key);

        self.head = node.next;
        if self.head.is_none() {
            self.tail = None;
        }
        if self.hint == Some(key) {
            self.hint = None;
        }

        Some(node.task)
    }

    /// Unlinks `task` if it is on the list.
    pub(crate) fn remove(&mut self, task: &Task) -> bool {
        let mut prev = None;
        let mut cursor = self.head;

        while let Some(c) = cursor {
            if self.nodes[c].task.ptr_eq(task) {
                break;
            }
            prev = Some(c);
            cursor = self.nodes[c].next;
        }

        let Some(key) = cursor else {
            return false;
        };

        let node = self.nodes.remove(key);
        match prev {
            Some(p) => self.nodes[p].next = node.next,
            None => self.head = node.next,
        }
        if self.tail == Some(key) {
            self.tail = prev;
        }
        if self.hint == Some(key) {
            self.hint = None;
        }

        true
    }

    pub(crate) fn contains(&self, task: &Task) -> bool {
        self.iter().any(|t| t.ptr_eq(task))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Task> {
        std::iter::successors(self.head, |&k| self.nodes[k].next).map(|k| &self.nodes[k].task)
    }

    #[cfg(test)]
    pub(crate) fn hint(&self) -> Option<&Task> {
        self.hint.map(|k| &self.nodes[k].task)
    }

    pub(crate) fn clear(&mut self) -> Vec<Task> {
        let mut tasks = Vec::with_capacity(self.len());
        while let Some(task) = self.pop_front() {
            tasks.push(task);
        }
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn task(priority: u8) -> Task {
        Task::new(priority, |_| {})
    }

    fn priorities(list: &PendingList) -> Vec<u8> {
        list.iter().map(|t| t.priority()).collect()
    }

    fn is_ordered(list: &PendingList, inserted: &[Task]) -> bool {
        // Non-increasing priority, FIFO among equals.
        let order = list.iter().collect::<Vec<_>>();
        order.windows(2).all(|w| {
            let pos = |t: &Task| inserted.iter().position(|i| i.ptr_eq(t)).unwrap();
            w[0].priority() > w[1].priority()
                || (w[0].priority() == w[1].priority() && pos(w[0]) < pos(w[1]))
        })
    }

    #[rstest]
    #[case::same_priority(vec![1, 1, 1, 1])]
    #[case::monotonic_down(vec![9, 7, 5, 3, 1])]
    #[case::monotonic_up(vec![1, 3, 5, 7, 9])]
    #[case::interleaved(vec![5, 10, 5, 10, 1, 7, 7, 0, 10])]
    #[case::urgent_interrupts(vec![2, 2, 2, 8, 2, 2, 8, 2, 9])]
    fn test_insert_keeps_priority_fifo_order(#[case] input: Vec<u8>) {
        let mut list = PendingList::new();
        let tasks = input.iter().map(|&p| task(p)).collect::<Vec<_>>();

        for t in &tasks {
            list.insert(t.clone());
        }

        assert_eq!(list.len(), tasks.len());
        assert!(is_ordered(&list, &tasks), "{:?}", priorities(&list));

        let mut expected = input.clone();
        expected.sort_by(|a, b| b.cmp(a));
        assert_eq!(priorities(&list), expected);
    }

    #[test]
    fn test_pop_front_drains_in_order() {
        let mut list = PendingList::new();
        let (x, y, z) = (task(5), task(10), task(5));

        list.insert(x.clone());
        list.insert(y.clone());
        list.insert(z.clone());

        assert!(list.pop_front().unwrap().ptr_eq(&y));
        assert!(list.pop_front().unwrap().ptr_eq(&x));
        assert!(list.pop_front().unwrap().ptr_eq(&z));
        assert!(list.pop_front().is_none());
        assert!(list.is_empty());
    }

    #[test]
    fn test_hint_tracks_last_insertion_ahead_of_tail() {
        let mut list = PendingList::new();

        list.insert(task(1));
        assert!(list.hint().is_none(), "appends leave the hint alone");

        let urgent = task(5);
        list.insert(urgent.clone());
        assert!(list.hint().unwrap().ptr_eq(&urgent));

        // Next urgent task of the same priority lands right behind the hint.
        let urgent2 = task(5);
        list.insert(urgent2.clone());
        assert!(list.hint().unwrap().ptr_eq(&urgent2));
        assert_eq!(priorities(&list), vec![5, 5, 1]);
    }

    #[test]
    fn test_stale_hint_is_not_used() {
        let mut list = PendingList::new();
        list.insert(task(1));
        list.insert(task(3));

        // Hint has priority 3, a priority 7 task must go before it.
        let top = task(7);
        list.insert(top.clone());

        assert!(list.iter().next().unwrap().ptr_eq(&top));
        assert_eq!(priorities(&list), vec![7, 3, 1]);
    }

    #[test]
    fn test_remove_invalidates_hint_and_tail() {
        let mut list = PendingList::new();
        let (a, b, c) = (task(1), task(4), task(1));

        list.insert(a.clone());
        list.insert(b.clone());
        list.insert(c.clone());
        assert!(list.hint().unwrap().ptr_eq(&b));

        assert!(list.remove(&b));
        assert!(list.hint().is_none());
        assert!(!list.remove(&b));

        assert!(list.remove(&c));
        let d = task(1);
        list.insert(d.clone());
        assert_eq!(list.iter().collect::<Vec<_>>().len(), 2);
        assert!(list.iter().last().unwrap().ptr_eq(&d));
        assert!(list.contains(&a));
        assert!(!list.contains(&c));
    }

    #[test]
    fn test_pop_invalidates_hint() {
        let mut list = PendingList::new();
        list.insert(task(1));
        let urgent = task(9);
        list.insert(urgent.clone());

        assert!(list.pop_front().unwrap().ptr_eq(&urgent));
        assert!(list.hint().is_none());

        // The freed slab key gets re-used by the next node, the hint must not
        // resurrect.
        list.insert(task(1));
        assert!(list.hint().is_none());
    }

    #[test]
    fn test_barrier_ignores_priority() {
        let mut list = PendingList::new();
        list.insert(task(3));

        let barrier = Task::barrier();
        list.push_barrier(barrier.clone());
        assert!(list.hint().unwrap().ptr_eq(&barrier));

        // While the hint sits on or after the barrier, inserts land behind it.
        list.insert(task(200));
        list.insert(task(1));
        list.insert(task(5));
        assert_eq!(priorities(&list), vec![3, 255, 200, 5, 1]);
    }

    #[test]
    fn test_clear() {
        let mut list = PendingList::new();
        for p in [1, 2, 3] {
            list.insert(task(p));
        }

        let drained = list.clear();
        assert_eq!(drained.iter().map(|t| t.priority()).collect::<Vec<_>>(), vec![3, 2, 1]);
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
    }
}
