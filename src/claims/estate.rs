//! Town and residence management: founding, treasury, buying land, creating
//! and selling residences.
//!
//! Every operation that touches more than one row runs in one sled
//! transaction, so a failed funds or contiguity check leaves nothing behind.

use log::{info, warn};
use sled::Transactional;

use crate::claims::errors::ClaimError;
use crate::claims::membership::drop_leadership_in_tx;
use crate::claims::region::replace_area_in_tx;
use crate::claims::storage::{
    decode_id, encode_id, keys, tx_abort, tx_decode, tx_encode, ClaimStore, TxResult,
};
use crate::claims::territory::{claim_in_tx, log_delta, town_in_tx, unique_cells, ClaimDelta};
use crate::claims::types::{
    BlockPos, CellCoord, Leadership, Location, Residence, ResidenceArea, ResidenceId, SubjectId,
    SubjectRecord, Town, TownId,
};
use crate::validation::{escape_log, validate_claim_name};

/// What a land purchase did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellPurchase {
    /// Cells the town did not own before.
    pub cells: usize,
    /// Amount taken from the treasury.
    pub cost: i64,
}

fn subject_in_tx(
    subjects: &sled::transaction::TransactionalTree,
    id: SubjectId,
) -> TxResult<SubjectRecord> {
    match subjects.get(keys::subject(id))? {
        Some(bytes) => tx_decode(&bytes),
        None => tx_abort(ClaimError::NotFound(format!("subject: {}", id))),
    }
}

fn positive(amount: i64) -> Result<i64, ClaimError> {
    if amount <= 0 {
        return Err(ClaimError::InvalidAmount(amount));
    }
    Ok(amount)
}

impl ClaimStore {
    /// Found a town: record, name index, first cell, founder as primary
    /// leader and inhabitant. The founder gives up leadership of any town it
    /// lived in. A first cell held by another town is annexed like any claim.
    pub fn create_town(
        &self,
        name: &str,
        founder: SubjectId,
        world: &str,
        first_cell: CellCoord,
    ) -> Result<Town, ClaimError> {
        let name = validate_claim_name(name)?;
        let id = self.next_id()?;
        let ids = [self.next_id()?];
        let leadership = Leadership {
            id: self.next_id()?,
            town: id,
            subject: founder,
            hidden: false,
        };
        let town = (&self.towns, &self.territory, &self.membership, &self.subjects)
            .transaction(|(towns, territory, membership, subjects)| -> TxResult<Town> {
                if towns.get(keys::name(&name))?.is_some() {
                    return tx_abort(ClaimError::NameTaken(name.clone()));
                }
                let mut founder_record = subject_in_tx(subjects, founder)?;
                if let Some(previous) = founder_record.town {
                    drop_leadership_in_tx(membership, previous, founder)?;
                }

                let mut town = Town::new(id, &name);
                towns.insert(keys::name(&name), encode_id(id))?;
                claim_in_tx(towns, territory, &mut town, world, &[first_cell], &ids)?;

                membership.insert(keys::primary_leader(id), tx_encode(&leadership)?)?;
                membership.insert(keys::led_by(founder, id), Vec::<u8>::new())?;
                founder_record.town = Some(id);
                subjects.insert(keys::subject(founder), tx_encode(&founder_record)?)?;
                Ok(town)
            })?;
        self.flush()?;
        info!(
            "town {} ({}) founded by subject {} at {},{} in {}",
            town.id,
            escape_log(&town.name),
            founder,
            first_cell.x,
            first_cell.z,
            world
        );
        Ok(town)
    }

    /// Credit the treasury. Returns the new balance.
    pub fn deposit(&self, town: TownId, amount: i64) -> Result<i64, ClaimError> {
        let amount = positive(amount)?;
        let balance = self.towns.transaction(|towns| -> TxResult<i64> {
            let mut record = town_in_tx(towns, town)?;
            record.treasury = record.treasury.saturating_add(amount);
            towns.insert(keys::town(town), tx_encode(&record)?)?;
            Ok(record.treasury)
        })?;
        self.towns.flush()?;
        info!("town {} treasury +{} = {}", town, amount, balance);
        Ok(balance)
    }

    /// Debit the treasury; refused when it would go negative.
    pub fn withdraw(&self, town: TownId, amount: i64) -> Result<i64, ClaimError> {
        let amount = positive(amount)?;
        let balance = self.towns.transaction(|towns| -> TxResult<i64> {
            let mut record = town_in_tx(towns, town)?;
            if record.treasury < amount {
                return tx_abort(ClaimError::InsufficientFunds {
                    needed: amount,
                    available: record.treasury,
                });
            }
            record.treasury -= amount;
            towns.insert(keys::town(town), tx_encode(&record)?)?;
            Ok(record.treasury)
        })?;
        self.towns.flush()?;
        info!("town {} treasury -{} = {}", town, amount, balance);
        Ok(balance)
    }

    /// Claim `cells` and pay `chunk_price` per newly owned cell out of the
    /// treasury, as one unit.
    pub fn buy_cells(
        &self,
        town: TownId,
        world: &str,
        cells: &[CellCoord],
        chunk_price: i64,
    ) -> Result<CellPurchase, ClaimError> {
        if chunk_price < 0 {
            return Err(ClaimError::InvalidAmount(chunk_price));
        }
        let cells = unique_cells(cells);
        let ids = cells
            .iter()
            .map(|_| self.next_id())
            .collect::<Result<Vec<_>, _>>()?;
        let (record, delta, cost) = (&self.towns, &self.territory).transaction(
            |(towns, territory)| -> TxResult<(Town, ClaimDelta, i64)> {
                let mut record = town_in_tx(towns, town)?;
                let delta = claim_in_tx(towns, territory, &mut record, world, &cells, &ids)?;
                let cost = chunk_price.saturating_mul(delta.len() as i64);
                if record.treasury < cost {
                    return tx_abort(ClaimError::InsufficientFunds {
                        needed: cost,
                        available: record.treasury,
                    });
                }
                record.treasury -= cost;
                towns.insert(keys::town(town), tx_encode(&record)?)?;
                Ok((record, delta, cost))
            },
        )?;
        self.flush()?;
        log_delta(&record, world, &delta);
        Ok(CellPurchase {
            cells: delta.len(),
            cost,
        })
    }

    /// Credit a subject's personal balance.
    pub fn credit_subject(&self, subject: SubjectId, amount: i64) -> Result<i64, ClaimError> {
        let amount = positive(amount)?;
        let mut record = self.get_subject(subject)?;
        record.balance = record.balance.saturating_add(amount);
        let balance = record.balance;
        self.put_subject(record)?;
        Ok(balance)
    }

    fn first_overlap(
        &self,
        area: &ResidenceArea,
        except: Option<ResidenceId>,
    ) -> Result<Option<ResidenceId>, ClaimError> {
        Ok(self
            .areas_intersecting(&area.world, area.low, area.high)?
            .into_iter()
            .map(|other| other.residence)
            .find(|other| Some(*other) != except))
    }

    /// Create a residence together with its box. Boxes of different
    /// residences never intersect.
    pub fn create_residence(
        &self,
        name: &str,
        town: Option<TownId>,
        owner: Option<SubjectId>,
        world: &str,
        a: BlockPos,
        b: BlockPos,
    ) -> Result<Residence, ClaimError> {
        let name = validate_claim_name(name)?;
        if let Some(town) = town {
            self.get_town(town)?;
        }
        if let Some(owner) = owner {
            self.get_subject(owner)?;
        }
        let id = self.next_id()?;
        let area_id = self.next_id()?;
        let area = ResidenceArea::new(id, world, a, b);
        if let Some(residence) = self.first_overlap(&area, None)? {
            return Err(ClaimError::Overlap { residence });
        }
        let residence = Residence::new(id, &name, town, owner);
        let bytes = Self::serialize(&residence)?;
        let cell_size = self.cell_size();
        (&self.residences, &self.regions).transaction(
            |(residences, regions)| -> TxResult<()> {
                if residences.get(keys::name(&name))?.is_some() {
                    return tx_abort(ClaimError::NameTaken(name.clone()));
                }
                residences.insert(keys::name(&name), encode_id(id))?;
                residences.insert(keys::residence(id), bytes.clone())?;
                replace_area_in_tx(regions, &area, area_id, cell_size)?;
                Ok(())
            },
        )?;
        self.flush()?;
        info!(
            "residence {} ({}) created in {} spanning {:?}..{:?}",
            id,
            escape_log(&name),
            world,
            area.low,
            area.high
        );
        Ok(residence)
    }

    /// Move the box of an existing residence. The new box may overlap the old
    /// one but no other residence.
    pub fn redefine_area(
        &self,
        residence: ResidenceId,
        world: &str,
        a: BlockPos,
        b: BlockPos,
    ) -> Result<ResidenceArea, ClaimError> {
        self.get_residence(residence)?;
        let area = ResidenceArea::new(residence, world, a, b);
        if let Some(other) = self.first_overlap(&area, Some(residence))? {
            return Err(ClaimError::Overlap { residence: other });
        }
        self.replace_area(&area)
    }

    pub fn set_for_sale(&self, residence: ResidenceId, price: i64) -> Result<(), ClaimError> {
        if price < 0 {
            return Err(ClaimError::InvalidAmount(price));
        }
        let mut record = self.get_residence(residence)?;
        record.for_sale = true;
        record.price = price;
        self.put_residence(record)?;
        info!("residence {} offered for {}", residence, price);
        Ok(())
    }

    pub fn withdraw_from_sale(&self, residence: ResidenceId) -> Result<(), ClaimError> {
        let mut record = self.get_residence(residence)?;
        if record.for_sale {
            record.for_sale = false;
            self.put_residence(record)?;
            info!("residence {} withdrawn from sale", residence);
        }
        Ok(())
    }

    /// Buy a residence that is for sale. The price goes to the previous owner,
    /// or to the owning town's treasury when nobody owned it. Explicit members
    /// are dropped with the sale.
    pub fn buy_residence(
        &self,
        residence: ResidenceId,
        buyer: SubjectId,
    ) -> Result<Residence, ClaimError> {
        let members = self.explicit_member_ids(residence)?;
        let sold = (&self.residences, &self.subjects, &self.towns, &self.membership).transaction(
            |(residences, subjects, towns, membership)| -> TxResult<Residence> {
                let Some(bytes) = residences.get(keys::residence(residence))? else {
                    return tx_abort(ClaimError::NotFound(format!("residence: {}", residence)));
                };
                let mut record: Residence = tx_decode(&bytes)?;
                if !record.for_sale || record.owner == Some(buyer) {
                    return tx_abort(ClaimError::NotForSale(residence));
                }
                let price = record.price;
                let mut buyer_record = subject_in_tx(subjects, buyer)?;
                if buyer_record.balance < price {
                    return tx_abort(ClaimError::InsufficientFunds {
                        needed: price,
                        available: buyer_record.balance,
                    });
                }
                buyer_record.balance -= price;
                subjects.insert(keys::subject(buyer), tx_encode(&buyer_record)?)?;

                match (record.owner, record.town) {
                    (Some(seller), _) => {
                        let mut seller_record = subject_in_tx(subjects, seller)?;
                        seller_record.balance = seller_record.balance.saturating_add(price);
                        subjects.insert(keys::subject(seller), tx_encode(&seller_record)?)?;
                    }
                    (None, Some(town)) => {
                        let mut town_record = town_in_tx(towns, town)?;
                        town_record.treasury = town_record.treasury.saturating_add(price);
                        towns.insert(keys::town(town), tx_encode(&town_record)?)?;
                    }
                    (None, None) => {}
                }

                for member in &members {
                    membership.remove(keys::member(residence, *member))?;
                }
                record.owner = Some(buyer);
                record.for_sale = false;
                residences.insert(keys::residence(residence), tx_encode(&record)?)?;
                Ok(record)
            },
        )?;
        self.flush()?;
        info!(
            "residence {} bought by subject {} for {}",
            residence, buyer, sold.price
        );
        Ok(sold)
    }

    /// Remember the marker a residence is advertised on.
    pub fn attach_sign(&self, residence: ResidenceId, sign: Location) -> Result<(), ClaimError> {
        let mut record = self.get_residence(residence)?;
        if let Some(previous) = &record.sign {
            if *previous != sign {
                warn!(
                    "residence {} sign moved from {:?} to {:?}",
                    residence, previous.pos, sign.pos
                );
            }
        }
        record.sign = Some(sign);
        self.put_residence(record)
    }

    /// Town whose name index points at `name`, as an id.
    pub fn town_id_by_name(&self, name: &str) -> Result<Option<TownId>, ClaimError> {
        Ok(self
            .towns
            .get(keys::name(name))?
            .and_then(|bytes| decode_id(&bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::storage::ClaimStoreBuilder;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> ClaimStore {
        ClaimStoreBuilder::new(dir.path()).open().expect("store")
    }

    #[test]
    fn founding_installs_leader_and_first_cell() {
        let dir = TempDir::new().expect("tempdir");
        let store = open(&dir);
        let founder = store.resolve_subject("alice").expect("subject");
        let town = store
            .create_town("Hollow", founder, "w", CellCoord::new(4, 4))
            .expect("town");

        assert!(store.owns(town.id, "w", CellCoord::new(4, 4)).expect("owns"));
        assert!(store.is_leader(town.id, founder).expect("leader"));
        assert!(store.is_inhabitant(town.id, founder).expect("inhabitant"));
        assert_eq!(store.get_town(town.id).expect("town").cell_count, 1);
        assert_eq!(store.town_id_by_name("hollow").expect("lookup"), Some(town.id));
    }

    #[test]
    fn founding_with_a_taken_name_changes_nothing() {
        let dir = TempDir::new().expect("tempdir");
        let store = open(&dir);
        let alice = store.resolve_subject("alice").expect("alice");
        let bob = store.resolve_subject("bob").expect("bob");
        store
            .create_town("Hollow", alice, "w", CellCoord::new(0, 0))
            .expect("first");
        let err = store
            .create_town("HOLLOW", bob, "w", CellCoord::new(9, 9))
            .expect_err("duplicate");
        assert!(matches!(err, ClaimError::NameTaken(_)));
        assert_eq!(store.chunk_at("w", CellCoord::new(9, 9)).expect("chunk"), None);
        assert_eq!(store.get_subject(bob).expect("bob").town, None);

        let err = store
            .create_town("wildness", bob, "w", CellCoord::new(9, 9))
            .expect_err("reserved");
        assert!(matches!(err, ClaimError::InvalidName(_)));
    }

    #[test]
    fn buying_cells_debits_only_new_cells() {
        let dir = TempDir::new().expect("tempdir");
        let store = open(&dir);
        let founder = store.resolve_subject("alice").expect("subject");
        let town = store
            .create_town("Hollow", founder, "w", CellCoord::new(0, 0))
            .expect("town");
        store.deposit(town.id, 250).expect("deposit");

        let purchase = store
            .buy_cells(
                town.id,
                "w",
                &[CellCoord::new(0, 0), CellCoord::new(1, 0), CellCoord::new(0, 1)],
                100,
            )
            .expect("buy");
        assert_eq!(purchase, CellPurchase { cells: 2, cost: 200 });
        assert_eq!(store.get_town(town.id).expect("town").treasury, 50);
    }

    #[test]
    fn failed_purchase_changes_nothing() {
        let dir = TempDir::new().expect("tempdir");
        let store = open(&dir);
        let founder = store.resolve_subject("alice").expect("subject");
        let town = store
            .create_town("Hollow", founder, "w", CellCoord::new(0, 0))
            .expect("town");
        store.deposit(town.id, 50).expect("deposit");

        let err = store
            .buy_cells(town.id, "w", &[CellCoord::new(1, 1)], 100)
            .expect_err("too poor");
        assert!(matches!(err, ClaimError::InsufficientFunds { needed: 100, available: 50 }));
        assert!(!store.owns(town.id, "w", CellCoord::new(1, 1)).expect("owns"));

        let err = store
            .buy_cells(town.id, "w", &[CellCoord::new(5, 5)], 0)
            .expect_err("detached");
        assert!(matches!(err, ClaimError::Contiguity { .. }));
        let record = store.get_town(town.id).expect("town");
        assert_eq!(record.treasury, 50);
        assert_eq!(record.cell_count, 1);
    }

    #[test]
    fn withdraw_is_prevalidated() {
        let dir = TempDir::new().expect("tempdir");
        let store = open(&dir);
        let founder = store.resolve_subject("alice").expect("subject");
        let town = store
            .create_town("Hollow", founder, "w", CellCoord::new(0, 0))
            .expect("town");
        store.deposit(town.id, 30).expect("deposit");
        assert!(matches!(
            store.withdraw(town.id, 31),
            Err(ClaimError::InsufficientFunds { .. })
        ));
        assert_eq!(store.withdraw(town.id, 30).expect("withdraw"), 0);
        assert!(matches!(store.deposit(town.id, 0), Err(ClaimError::InvalidAmount(0))));
    }

    #[test]
    fn residences_may_not_overlap() {
        let dir = TempDir::new().expect("tempdir");
        let store = open(&dir);
        let first = store
            .create_residence("Cottage", None, None, "w", BlockPos::new(0, 0, 0), BlockPos::new(5, 5, 5))
            .expect("first");
        let err = store
            .create_residence("Shed", None, None, "w", BlockPos::new(5, 5, 5), BlockPos::new(8, 8, 8))
            .expect_err("touching corner");
        assert_eq!(
            err.to_string(),
            ClaimError::Overlap { residence: first.id }.to_string()
        );
        let shed = store
            .create_residence("Shed", None, None, "w", BlockPos::new(6, 0, 0), BlockPos::new(8, 8, 8))
            .expect("adjacent box");

        store
            .redefine_area(first.id, "w", BlockPos::new(0, 0, 0), BlockPos::new(3, 9, 3))
            .expect("shrink over itself");
        assert!(matches!(
            store.redefine_area(first.id, "w", BlockPos::new(0, 0, 0), BlockPos::new(6, 1, 1)),
            Err(ClaimError::Overlap { residence }) if residence == shed.id
        ));
    }

    #[test]
    fn buying_a_residence_moves_money_and_clears_members() {
        let dir = TempDir::new().expect("tempdir");
        let store = open(&dir);
        let seller = store.resolve_subject("seller").expect("seller");
        let buyer = store.resolve_subject("buyer").expect("buyer");
        let guest = store.resolve_subject("guest").expect("guest");
        let house = store
            .create_residence("Cottage", None, Some(seller), "w", BlockPos::new(0, 0, 0), BlockPos::new(4, 4, 4))
            .expect("house");
        store.add_member(house.id, guest).expect("member");

        assert!(matches!(
            store.buy_residence(house.id, buyer),
            Err(ClaimError::NotForSale(_))
        ));
        store.set_for_sale(house.id, 70).expect("list");
        assert!(matches!(
            store.buy_residence(house.id, buyer),
            Err(ClaimError::InsufficientFunds { needed: 70, available: 0 })
        ));

        store.credit_subject(buyer, 100).expect("credit");
        let sold = store.buy_residence(house.id, buyer).expect("buy");
        assert_eq!(sold.owner, Some(buyer));
        assert!(!sold.for_sale);
        assert_eq!(store.get_subject(buyer).expect("buyer").balance, 30);
        assert_eq!(store.get_subject(seller).expect("seller").balance, 70);
        assert!(!store.is_member(house.id, guest).expect("member"));
        assert!(store.is_member(house.id, buyer).expect("owner"));
    }

    #[test]
    fn unowned_town_residence_pays_the_treasury() {
        let dir = TempDir::new().expect("tempdir");
        let store = open(&dir);
        let mayor = store.resolve_subject("mayor").expect("mayor");
        let buyer = store.resolve_subject("buyer").expect("buyer");
        let town = store
            .create_town("Hollow", mayor, "w", CellCoord::new(0, 0))
            .expect("town");
        let plot = store
            .create_residence("Plot One", Some(town.id), None, "w", BlockPos::new(1, 0, 1), BlockPos::new(3, 3, 3))
            .expect("plot");
        store.set_for_sale(plot.id, 40).expect("list");
        store.credit_subject(buyer, 40).expect("credit");
        store.buy_residence(plot.id, buyer).expect("buy");
        assert_eq!(store.get_town(town.id).expect("town").treasury, 40);
    }

    #[test]
    fn sign_is_remembered() {
        let dir = TempDir::new().expect("tempdir");
        let store = open(&dir);
        let house = store
            .create_residence("Cottage", None, None, "w", BlockPos::new(0, 0, 0), BlockPos::new(1, 1, 1))
            .expect("house");
        let sign = Location::new("w", 2, 1, 0);
        store.attach_sign(house.id, sign.clone()).expect("sign");
        assert_eq!(store.get_residence(house.id).expect("house").sign, Some(sign));
    }
}
