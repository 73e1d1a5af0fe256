use battleship_engine_protocol::messages::{
    ActiveShip, HitState, Orientation, Ship, ShipGridRow, ShipGridView,
};
use rand::Rng;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum BoardError {
    #[error("ship placement invalid: {0}")]
    InvalidPlacement(String),

    #[error("cell already shot at")]
    AlreadyShot,

    #[error("no untouched cell remains")]
    NoLegalShot,
}

#[derive(Debug, Clone)]
struct Cell {
    ship: Option<usize>,
    hit_state: HitState,
}

/// A single player's R x C grid: placed ships plus the hit-state of every
/// cell. Constructed once from the ships persisted at the end of
/// placement; mutated exactly once per resolved shot thereafter.
#[derive(Debug, Clone)]
pub struct Board {
    rows: u32,
    cols: u32,
    cells: Vec<Vec<Cell>>,
    ships: Vec<ActiveShip>,
}

fn occupied_cells(ship: &Ship) -> Vec<(u32, u32)> {
    (0..ship.length)
        .map(|k| match Orientation::from_i32(ship.orientation) {
            Some(Orientation::Vertical) => (ship.head_row + k, ship.head_col),
            _ => (ship.head_row, ship.head_col + k),
        })
        .collect()
}

impl Board {
    pub fn new(ships: Vec<Ship>, rows: u32, cols: u32) -> Result<Board, BoardError> {
        let mut cells = vec![
            vec![
                Cell {
                    ship: None,
                    hit_state: HitState::Untouched,
                };
                cols as usize
            ];
            rows as usize
        ];

        let mut active_ships = Vec::with_capacity(ships.len());
        for (idx, ship) in ships.into_iter().enumerate() {
            let coords = occupied_cells(&ship);
            for &(r, c) in &coords {
                if r >= rows || c >= cols {
                    return Err(BoardError::InvalidPlacement(format!(
                        "ship {idx} occupies out-of-range cell ({r}, {c})"
                    )));
                }
                if cells[r as usize][c as usize].ship.is_some() {
                    return Err(BoardError::InvalidPlacement(format!(
                        "ship {idx} overlaps an already-placed ship"
                    )));
                }
            }
            for &(r, c) in &coords {
                cells[r as usize][c as usize].ship = Some(idx);
            }
            active_ships.push(ActiveShip {
                length: ship.length,
                orientation: ship.orientation,
                head_row: ship.head_row,
                head_col: ship.head_col,
                hits: vec![false; ship.length as usize],
            });
        }

        Ok(Board {
            rows,
            cols,
            cells,
            ships: active_ships,
        })
    }

    fn segment_index(ship: &ActiveShip, r: u32, c: u32) -> usize {
        match Orientation::from_i32(ship.orientation) {
            Some(Orientation::Vertical) => (r - ship.head_row) as usize,
            _ => (c - ship.head_col) as usize,
        }
    }

    /// Resolves a shot at (r, c). Returns the ship that was just sunk by
    /// this shot, if any.
    pub fn shoot_at(&mut self, r: u32, c: u32) -> Result<(bool, Option<ActiveShip>), BoardError> {
        let cell = &mut self.cells[r as usize][c as usize];
        if cell.hit_state != HitState::Untouched {
            return Err(BoardError::AlreadyShot);
        }

        let Some(ship_idx) = cell.ship else {
            cell.hit_state = HitState::Miss;
            return Ok((false, None));
        };

        cell.hit_state = HitState::Hit;
        let ship = &mut self.ships[ship_idx];
        let seg = Self::segment_index(ship, r, c);
        ship.hits[seg] = true;

        if ship.is_sunk() {
            Ok((true, Some(ship.clone())))
        } else {
            Ok((true, None))
        }
    }

    pub fn all_ships_sunk(&self) -> bool {
        self.ships.iter().all(ActiveShip::is_sunk)
    }

    fn hit_grid(&self) -> Vec<ShipGridRow> {
        self.cells
            .iter()
            .map(|row| ShipGridRow {
                cells: row.iter().map(|c| c.hit_state as i32).collect(),
            })
            .collect()
    }

    pub fn own_view(&self) -> ShipGridView {
        ShipGridView {
            hit_grid: self.hit_grid(),
            ships: self.ships.clone(),
        }
    }

    pub fn opponent_view(&self) -> ShipGridView {
        ShipGridView {
            hit_grid: self.hit_grid(),
            ships: self
                .ships
                .iter()
                .filter(|s| s.is_sunk())
                .cloned()
                .collect(),
        }
    }

    pub fn random_legal_shot(&self) -> Result<(u32, u32), BoardError> {
        let mut untouched = Vec::new();
        for (r, row) in self.cells.iter().enumerate() {
            for (c, cell) in row.iter().enumerate() {
                if cell.hit_state == HitState::Untouched {
                    untouched.push((r as u32, c as u32));
                }
            }
        }
        if untouched.is_empty() {
            return Err(BoardError::NoLegalShot);
        }
        let idx = rand::thread_rng().gen_range(0..untouched.len());
        Ok(untouched[idx])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn single_ship(orientation: Orientation, head_row: u32, head_col: u32, length: u32) -> Ship {
        Ship {
            length,
            orientation: orientation as i32,
            head_row,
            head_col,
        }
    }

    #[test]
    fn placement_rejects_overlap() {
        let ships = vec![
            single_ship(Orientation::Horizontal, 0, 0, 3),
            single_ship(Orientation::Vertical, 0, 1, 2),
        ];
        assert!(matches!(
            Board::new(ships, 10, 10),
            Err(BoardError::InvalidPlacement(_))
        ));
    }

    #[test]
    fn placement_rejects_out_of_range() {
        let ships = vec![single_ship(Orientation::Horizontal, 0, 8, 3)];
        assert!(matches!(
            Board::new(ships, 10, 10),
            Err(BoardError::InvalidPlacement(_))
        ));
    }

    #[test]
    fn shoot_at_same_cell_twice_errors() {
        let ships = vec![single_ship(Orientation::Horizontal, 0, 0, 2)];
        let mut board = Board::new(ships, 10, 10).unwrap();
        board.shoot_at(0, 0).unwrap();
        assert_eq!(board.shoot_at(0, 0), Err(BoardError::AlreadyShot));
    }

    #[test]
    fn sinking_every_segment_sinks_the_ship_and_the_board() {
        let ships = vec![single_ship(Orientation::Horizontal, 0, 0, 2)];
        let mut board = Board::new(ships, 10, 10).unwrap();

        let (hit, sunk) = board.shoot_at(0, 0).unwrap();
        assert!(hit);
        assert!(sunk.is_none());
        assert!(!board.all_ships_sunk());

        let (hit, sunk) = board.shoot_at(0, 1).unwrap();
        assert!(hit);
        assert!(sunk.is_some());
        assert!(board.all_ships_sunk());
    }

    #[test]
    fn opponent_view_hides_unsunk_ships() {
        let ships = vec![single_ship(Orientation::Horizontal, 0, 0, 2)];
        let mut board = Board::new(ships, 10, 10).unwrap();
        board.shoot_at(0, 0).unwrap();

        assert!(board.opponent_view().ships.is_empty());
        assert_eq!(board.own_view().ships.len(), 1);

        board.shoot_at(0, 1).unwrap();
        assert_eq!(board.opponent_view().ships.len(), 1);
    }

    #[test]
    fn random_legal_shot_never_reused_cell() {
        let ships = vec![single_ship(Orientation::Horizontal, 0, 0, 1)];
        let board = Board::new(ships, 2, 2).unwrap();
        for _ in 0..20 {
            let (r, c) = board.random_legal_shot().unwrap();
            assert!(r < 2 && c < 2);
        }
    }

    #[test]
    fn random_legal_shot_fails_when_board_fully_shot() {
        let ships = vec![single_ship(Orientation::Horizontal, 0, 0, 1)];
        let mut board = Board::new(ships, 1, 1).unwrap();
        board.shoot_at(0, 0).unwrap();
        assert_eq!(board.random_legal_shot(), Err(BoardError::NoLegalShot));
    }
}
