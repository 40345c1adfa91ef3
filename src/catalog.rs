use rusqlite::Connection;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeltEntry {
    pub id: i64,
    pub key: String,
    pub name: String,
    pub order: i64,
    pub max_degrees: u32,
    pub color: String,
}

/// Ranks seeded into every new workspace: (key, display name, max degrees, color).
pub const BUILTIN_BELTS: &[(&str, &str, u32, &str)] = &[
    ("branca", "Branca", 4, "#ffffff"),
    ("cinza", "Cinza", 4, "#A0AEC0"),
    ("amarela", "Amarela", 4, "#ECC94B"),
    ("laranja", "Laranja", 4, "#ED8936"),
    ("verde", "Verde", 4, "#48BB78"),
    ("azul", "Azul", 4, "#4299E1"),
    ("roxa", "Roxa", 4, "#9F7AEA"),
    ("marrom", "Marrom", 4, "#8B4513"),
    ("preta", "Preta", 6, "#000000"),
    ("coral", "Coral", 8, "#FF7F50"),
    ("vermelha", "Vermelha", 10, "#E53E3E"),
];

/// Ordered belt reference data. Entries are kept sorted by rank order, so the
/// first entry is always the fallback rank.
#[derive(Debug, Clone)]
pub struct BeltCatalog {
    entries: Vec<BeltEntry>,
}

impl BeltCatalog {
    pub fn builtin() -> Self {
        let entries = BUILTIN_BELTS
            .iter()
            .enumerate()
            .map(|(i, (key, name, max_degrees, color))| BeltEntry {
                id: i as i64 + 1,
                key: key.to_string(),
                name: name.to_string(),
                order: i as i64 + 1,
                max_degrees: *max_degrees,
                color: color.to_string(),
            })
            .collect();
        Self { entries }
    }

    /// Builds a catalog from arbitrary rows. An empty input yields the
    /// built-in catalog so there is always a lowest rank to fall back to.
    pub fn from_entries(mut entries: Vec<BeltEntry>) -> Self {
        if entries.is_empty() {
            return Self::builtin();
        }
        entries.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        Self { entries }
    }

    pub fn load(conn: &Connection) -> rusqlite::Result<Self> {
        let mut stmt = conn.prepare(
            "SELECT id, key, name, sort_order, max_degrees, color
             FROM belt_catalog
             ORDER BY sort_order, id",
        )?;
        let entries = stmt
            .query_map([], |r| {
                Ok(BeltEntry {
                    id: r.get(0)?,
                    key: r.get(1)?,
                    name: r.get(2)?,
                    order: r.get(3)?,
                    max_degrees: r.get::<_, i64>(4)?.max(0) as u32,
                    color: r.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_entries(entries))
    }

    pub fn entries(&self) -> &[BeltEntry] {
        &self.entries
    }

    pub fn lowest(&self) -> &BeltEntry {
        // from_entries never leaves the list empty
        &self.entries[0]
    }

    pub fn by_id(&self, id: i64) -> Option<&BeltEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Case-insensitive lookup on either the rank key or its display name.
    pub fn lookup(&self, name: &str) -> Option<&BeltEntry> {
        let needle = name.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }
        self.entries
            .iter()
            .find(|e| e.key.to_lowercase() == needle || e.name.to_lowercase() == needle)
    }

    /// Like `lookup`, but unresolvable names land on the lowest rank.
    pub fn lookup_or_lowest(&self, name: &str) -> &BeltEntry {
        self.lookup(name).unwrap_or_else(|| self.lowest())
    }
}
