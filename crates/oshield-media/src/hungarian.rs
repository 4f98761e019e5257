//! Minimum-cost assignment (Kuhn–Munkres) for track/detection matching.

/// Solve the rectangular assignment problem on a cost matrix.
///
/// Returns, for each row, the column it was assigned to. Rows beyond the
/// number of columns (and vice versa) stay unassigned via implicit
/// zero-cost padding, so callers must still gate accepted pairs on their
/// own cost threshold.
pub fn minimum_cost_assignment(cost: &[Vec<f64>]) -> Vec<Option<usize>> {
    let rows = cost.len();
    if rows == 0 {
        return Vec::new();
    }
    let cols = cost[0].len();
    if cols == 0 {
        return vec![None; rows];
    }
    let dim = rows.max(cols);

    let padded = |i: usize, j: usize| -> f64 {
        if i < rows && j < cols {
            cost[i][j]
        } else {
            0.0
        }
    };

    // Potentials over rows (u) and columns (v); p[j] is the row matched to
    // column j, 1-indexed with 0 as the virtual unmatched slot.
    let mut u = vec![0.0f64; dim + 1];
    let mut v = vec![0.0f64; dim + 1];
    let mut p = vec![0usize; dim + 1];
    let mut way = vec![0usize; dim + 1];

    for i in 1..=dim {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![f64::INFINITY; dim + 1];
        let mut used = vec![false; dim + 1];

        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;

            for j in 1..=dim {
                if used[j] {
                    continue;
                }
                let reduced = padded(i0 - 1, j - 1) - u[i0] - v[j];
                if reduced < minv[j] {
                    minv[j] = reduced;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }

            for j in 0..=dim {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }

            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }

        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut assignment = vec![None; rows];
    for j in 1..=dim {
        let i = p[j];
        if i >= 1 && i <= rows && j <= cols {
            assignment[i - 1] = Some(j - 1);
        }
    }
    assignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_assignment() {
        let cost = vec![
            vec![0.0, 1.0, 1.0],
            vec![1.0, 0.0, 1.0],
            vec![1.0, 1.0, 0.0],
        ];
        let assignment = minimum_cost_assignment(&cost);
        assert_eq!(assignment, vec![Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn test_optimal_over_greedy() {
        // Greedy on row 0 would take column 0 (cost 1) and force total 1 + 4;
        // the optimal picks the anti-diagonal with total 2 + 2.
        let cost = vec![vec![1.0, 2.0], vec![2.0, 4.0]];
        let assignment = minimum_cost_assignment(&cost);
        let total: f64 = assignment
            .iter()
            .enumerate()
            .map(|(i, j)| cost[i][j.unwrap()])
            .sum();
        assert!((total - 4.0).abs() < 1e-9);
        assert_eq!(assignment, vec![Some(1), Some(0)]);
    }

    #[test]
    fn test_rectangular_more_rows_than_cols() {
        let cost = vec![vec![5.0], vec![1.0], vec![3.0]];
        let assignment = minimum_cost_assignment(&cost);
        let assigned: Vec<usize> = assignment
            .iter()
            .enumerate()
            .filter_map(|(i, j)| j.map(|_| i))
            .collect();
        assert_eq!(assigned, vec![1]);
    }

    #[test]
    fn test_rectangular_more_cols_than_rows() {
        let cost = vec![vec![9.0, 2.0, 7.0]];
        let assignment = minimum_cost_assignment(&cost);
        assert_eq!(assignment, vec![Some(1)]);
    }

    #[test]
    fn test_empty_matrix() {
        assert!(minimum_cost_assignment(&[]).is_empty());
        let no_cols: Vec<Vec<f64>> = vec![vec![], vec![]];
        assert_eq!(minimum_cost_assignment(&no_cols), vec![None, None]);
    }
}
