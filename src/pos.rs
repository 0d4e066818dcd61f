//! Grid coordinates.
//!
//! A container occupies integer coordinates on an infinite grid; each
//! container holds a 32x32 block of cells. A global cell position `(x, z)`
//! decomposes into the container at `(x >> 5, z >> 5)` and the cell-local
//! `(x & 31, z & 31)` within it. The decomposition uses arithmetic shifts,
//! so negative coordinates land in negative containers.

/// Position of a container file on the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContainerPos {
    pub x: i32,
    pub z: i32,
}

impl ContainerPos {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Global position of the cell at `(x, z)` within this container.
    ///
    /// Sibling files for spilled cells are named by this global position,
    /// not the cell-local one.
    pub fn global(&self, x: u8, z: u8) -> GlobalPos {
        GlobalPos {
            x: self.x << 5 | x as i32,
            z: self.z << 5 | z as i32,
        }
    }
}

/// Global position of a single cell across all containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalPos {
    pub x: i32,
    pub z: i32,
}

impl GlobalPos {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// The container holding this cell.
    pub fn container(&self) -> ContainerPos {
        ContainerPos {
            x: self.x >> 5,
            z: self.z >> 5,
        }
    }

    /// Cell-local coordinates within [`Self::container`].
    pub fn cell(&self) -> (u8, u8) {
        ((self.x & 31) as u8, (self.z & 31) as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_decomposes_into_container_and_cell() {
        let pos = GlobalPos::new(65, 33);

        assert_eq!(pos.container(), ContainerPos::new(2, 1));
        assert_eq!(pos.cell(), (1, 1));
    }

    #[test]
    fn negative_coordinates_use_arithmetic_shift() {
        let pos = GlobalPos::new(-1, -32);

        assert_eq!(pos.container(), ContainerPos::new(-1, -1));
        assert_eq!(pos.cell(), (31, 0));
    }

    #[test]
    fn container_global_round_trips() {
        for &(x, z) in &[(0i32, 0i32), (5, -3), (-1, 7)] {
            let container = ContainerPos::new(x, z);
            for &(cx, cz) in &[(0u8, 0u8), (31, 31), (17, 4)] {
                let global = container.global(cx, cz);
                assert_eq!(global.container(), container);
                assert_eq!(global.cell(), (cx, cz));
            }
        }
    }
}
