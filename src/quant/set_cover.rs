/// Greedy weighted set cover.
///
/// `sets[i]` lists the element ids (0..element_count) that set `i` covers,
/// `weights[i]` is its total weight. Each round picks the set with the
/// lowest weight per newly covered element, lower index winning ties, until
/// every element is covered or no remaining set covers anything new.
/// Returns the chosen set indices in selection order. Deterministic, and an
/// approximation only; nothing here tries to be minimal.
pub fn greedy_set_cover(sets: &[Vec<usize>], weights: &[f64], element_count: usize) -> Vec<usize> {
    debug_assert_eq!(sets.len(), weights.len());
    let mut covered = vec![false; element_count];
    let mut remaining = element_count;
    let mut used = vec![false; sets.len()];
    let mut chosen = Vec::new();

    while remaining > 0 {
        let mut best: Option<(f64, usize)> = None;
        for (i, set) in sets.iter().enumerate() {
            if used[i] {
                continue;
            }
            let new_elements = set.iter().filter(|&&e| !covered[e]).count();
            if new_elements == 0 {
                continue;
            }
            let score = weights[i] / new_elements as f64;
            let better = match best {
                None => true,
                Some((best_score, _)) => score < best_score,
            };
            if better {
                best = Some((score, i));
            }
        }
        let (_, pick) = match best {
            Some(b) => b,
            None => break, // nothing left can cover a new element
        };
        used[pick] = true;
        chosen.push(pick);
        for &e in &sets[pick] {
            if !covered[e] {
                covered[e] = true;
                remaining -= 1;
            }
        }
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_set_covers_all() {
        let sets = vec![vec![0, 1, 2]];
        let chosen = greedy_set_cover(&sets, &[3.0], 3);
        assert_eq!(chosen, vec![0]);
    }

    #[test]
    fn prefers_cheap_wide_sets() {
        // set 0 covers everything at weight 3, sets 1..3 cover one each at weight 1
        let sets = vec![vec![0, 1, 2], vec![0], vec![1], vec![2]];
        let weights = vec![3.0, 1.0, 1.0, 1.0];
        let chosen = greedy_set_cover(&sets, &weights, 3);
        assert_eq!(chosen, vec![0]);
    }

    #[test]
    fn picks_multiple_sets_when_needed() {
        let sets = vec![vec![0, 1], vec![2, 3], vec![0, 2]];
        let weights = vec![2.0, 2.0, 2.0];
        let chosen = greedy_set_cover(&sets, &weights, 4);
        assert_eq!(chosen, vec![0, 1]);
    }

    #[test]
    fn stops_when_elements_are_uncoverable() {
        // element 2 is in no set
        let sets = vec![vec![0], vec![1]];
        let chosen = greedy_set_cover(&sets, &[1.0, 1.0], 3);
        assert_eq!(chosen, vec![0, 1]);
    }

    #[test]
    fn deterministic_tie_break_on_index() {
        let sets = vec![vec![0], vec![0]];
        let chosen = greedy_set_cover(&sets, &[1.0, 1.0], 1);
        assert_eq!(chosen, vec![0]);
    }
}
