use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const TOWN_SCHEMA_VERSION: u8 = 1;
pub const CHUNK_SCHEMA_VERSION: u8 = 1;
pub const RESIDENCE_SCHEMA_VERSION: u8 = 1;
pub const AREA_SCHEMA_VERSION: u8 = 1;
pub const SUBJECT_SCHEMA_VERSION: u8 = 1;

/// Edge length of a grid cell in blocks.
pub const DEFAULT_CELL_SIZE: i32 = 16;

/// Longest accepted town or residence name.
pub const MAX_NAME_LEN: usize = 32;

pub type TownId = u64;
pub type ResidenceId = u64;
pub type SubjectId = u64;

/// A block position inside a world.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

/// A block position qualified by the world it lives in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Location {
    pub world: String,
    pub pos: BlockPos,
}

impl Location {
    pub fn new(world: &str, x: i32, y: i32, z: i32) -> Self {
        Self {
            world: world.to_string(),
            pos: BlockPos::new(x, y, z),
        }
    }

    /// Grid cell holding this location for the given cell size.
    pub fn cell(&self, cell_size: i32) -> CellCoord {
        CellCoord::containing(self.pos, cell_size)
    }
}

/// Grid coordinates of a claimable column of the world.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellCoord {
    pub x: i32,
    pub z: i32,
}

impl CellCoord {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    pub fn containing(pos: BlockPos, cell_size: i32) -> Self {
        Self {
            x: pos.x.div_euclid(cell_size),
            z: pos.z.div_euclid(cell_size),
        }
    }

    /// Chebyshev distance 1, excluding the cell itself.
    pub fn is_adjacent(&self, other: &CellCoord) -> bool {
        self != other
            && (i64::from(self.x) - i64::from(other.x)).abs() <= 1
            && (i64::from(self.z) - i64::from(other.z)).abs() <= 1
    }

    /// The cells surrounding this one; at the edge of the coordinate range
    /// there are fewer than eight.
    pub fn neighbors(&self) -> impl Iterator<Item = CellCoord> + '_ {
        (-1..=1).flat_map(move |dx| {
            (-1..=1).filter_map(move |dz| {
                if dx == 0 && dz == 0 {
                    return None;
                }
                Some(CellCoord::new(
                    self.x.checked_add(dx)?,
                    self.z.checked_add(dz)?,
                ))
            })
        })
    }
}

/// Columns in the inclusive rectangle `[lo, hi]`.
pub fn column_span(lo: CellCoord, hi: CellCoord) -> u64 {
    let dx = (i64::from(hi.x) - i64::from(lo.x) + 1).max(0) as u64;
    let dz = (i64::from(hi.z) - i64::from(lo.z) + 1).max(0) as u64;
    dx.saturating_mul(dz)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Town {
    pub id: TownId,
    pub name: String,
    /// Treasury in minor currency units.
    pub treasury: i64,
    pub founded_at: DateTime<Utc>,
    pub tax_rate: f64,
    /// Number of owned cells; kept in the record so claims can test the
    /// bootstrap case inside a transaction.
    #[serde(default)]
    pub cell_count: u32,
    pub schema_version: u8,
}

impl Town {
    pub fn new(id: TownId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            treasury: 0,
            founded_at: Utc::now(),
            tax_rate: 0.0,
            cell_count: 0,
            schema_version: TOWN_SCHEMA_VERSION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TownChunk {
    pub id: u64,
    pub town: TownId,
    pub world: String,
    pub x: i32,
    pub z: i32,
    pub schema_version: u8,
}

impl TownChunk {
    pub fn cell(&self) -> CellCoord {
        CellCoord::new(self.x, self.z)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Residence {
    pub id: ResidenceId,
    pub name: String,
    /// `None` means the residence lies in the wildness.
    pub town: Option<TownId>,
    /// `None` means nobody owns it.
    pub owner: Option<SubjectId>,
    pub value: i64,
    pub price: i64,
    pub for_sale: bool,
    #[serde(default)]
    pub sign: Option<Location>,
    pub created_at: DateTime<Utc>,
    pub schema_version: u8,
}

impl Residence {
    pub fn new(id: ResidenceId, name: &str, town: Option<TownId>, owner: Option<SubjectId>) -> Self {
        Self {
            id,
            name: name.to_string(),
            town,
            owner,
            value: 0,
            price: 0,
            for_sale: false,
            sign: None,
            created_at: Utc::now(),
            schema_version: RESIDENCE_SCHEMA_VERSION,
        }
    }
}

/// Inclusive axis-aligned box owned by exactly one residence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResidenceArea {
    pub id: u64,
    pub residence: ResidenceId,
    pub world: String,
    pub low: BlockPos,
    pub high: BlockPos,
    pub schema_version: u8,
}

impl ResidenceArea {
    /// Build an area from two arbitrary corners; the stored corners are
    /// normalized so that `low <= high` on every axis.
    pub fn new(residence: ResidenceId, world: &str, a: BlockPos, b: BlockPos) -> Self {
        Self {
            id: 0,
            residence,
            world: world.to_string(),
            low: BlockPos::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            high: BlockPos::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
            schema_version: AREA_SCHEMA_VERSION,
        }
    }

    pub fn contains(&self, loc: &Location) -> bool {
        loc.world == self.world
            && (self.low.x..=self.high.x).contains(&loc.pos.x)
            && (self.low.y..=self.high.y).contains(&loc.pos.y)
            && (self.low.z..=self.high.z).contains(&loc.pos.z)
    }

    pub fn intersects(&self, world: &str, low: BlockPos, high: BlockPos) -> bool {
        world == self.world
            && self.low.x <= high.x
            && low.x <= self.high.x
            && self.low.y <= high.y
            && low.y <= self.high.y
            && self.low.z <= high.z
            && low.z <= self.high.z
    }

    pub fn overlaps(&self, other: &ResidenceArea) -> bool {
        self.intersects(&other.world, other.low, other.high)
    }

    /// Number of grid columns the box spans, without listing them.
    pub fn column_span(&self, cell_size: i32) -> u64 {
        let lo = CellCoord::containing(self.low, cell_size);
        let hi = CellCoord::containing(self.high, cell_size);
        column_span(lo, hi)
    }

    /// Grid cells (columns) spanned by the box.
    pub fn cells(&self, cell_size: i32) -> Vec<CellCoord> {
        let lo = CellCoord::containing(self.low, cell_size);
        let hi = CellCoord::containing(self.high, cell_size);
        let mut cells = Vec::new();
        for x in lo.x..=hi.x {
            for z in lo.z..=hi.z {
                cells.push(CellCoord::new(x, z));
            }
        }
        cells
    }

    pub fn volume(&self) -> i64 {
        let dx = i64::from(self.high.x) - i64::from(self.low.x) + 1;
        let dy = i64::from(self.high.y) - i64::from(self.low.y) + 1;
        let dz = i64::from(self.high.z) - i64::from(self.low.z) + 1;
        dx * dy * dz
    }
}

/// Explicit residence member row; the owner is a member without one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Membership {
    pub id: u64,
    pub residence: ResidenceId,
    pub subject: SubjectId,
}

/// Town leadership row. `hidden` marks a co-leader.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Leadership {
    pub id: u64,
    pub town: TownId,
    pub subject: SubjectId,
    pub hidden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Like {
    pub id: u64,
    pub residence: ResidenceId,
    pub subject: SubjectId,
    pub liked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubjectRecord {
    pub id: SubjectId,
    pub name: String,
    pub level: u8,
    /// Town this subject lives in, if any.
    pub town: Option<TownId>,
    pub balance: i64,
    pub created_at: DateTime<Utc>,
    pub schema_version: u8,
}

impl SubjectRecord {
    pub fn new(id: SubjectId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            level: crate::claims::roles::LEVEL_PLAYER,
            town: None,
            balance: 0,
            created_at: Utc::now(),
            schema_version: SUBJECT_SCHEMA_VERSION,
        }
    }
}

/// Kind of action the permission resolver decides on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Place,
    Destroy,
    Interact,
    Spawn,
}

impl ActionKind {
    pub const ALL: [ActionKind; 4] = [
        ActionKind::Place,
        ActionKind::Destroy,
        ActionKind::Interact,
        ActionKind::Spawn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Place => "place",
            ActionKind::Destroy => "destroy",
            ActionKind::Interact => "interact",
            ActionKind::Spawn => "spawn",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "place" | "build" => Some(ActionKind::Place),
            "destroy" | "break" => Some(ActionKind::Destroy),
            "interact" | "use" => Some(ActionKind::Interact),
            "spawn" => Some(ActionKind::Spawn),
            _ => None,
        }
    }
}

/// Why a creature is appearing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SpawnReason {
    Natural,
    Spawner,
    Egg,
    Breeding,
    Custom,
}

impl SpawnReason {
    pub fn is_artificial_spawner(&self) -> bool {
        matches!(self, SpawnReason::Spawner)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "natural" => Some(SpawnReason::Natural),
            "spawner" => Some(SpawnReason::Spawner),
            "egg" => Some(SpawnReason::Egg),
            "breeding" => Some(SpawnReason::Breeding),
            "custom" => Some(SpawnReason::Custom),
            _ => None,
        }
    }
}
