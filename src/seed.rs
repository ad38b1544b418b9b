// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Startup seed data: products and opening stock from CSV.

use crate::base::ProductId;
use crate::catalog::{InMemoryCatalog, Product};
use crate::inventory::InventoryLedger;
use csv::{ReaderBuilder, Trim};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

/// Raw CSV record matching the seed format.
///
/// Fields: `product_id, name, price, stock`
#[derive(Debug, Deserialize)]
struct SeedRecord {
    product_id: u32,
    name: String,
    price: Decimal,
    stock: u32,
}

/// Loads products and stock from a CSV reader.
///
/// Malformed rows and rows with a negative price are skipped with a warning.
/// Returns the number of products loaded.
///
/// # CSV Format
///
/// ```csv
/// product_id,name,price,stock
/// 1,Ceramic mug,8.50,40
/// 2,Tea towel,4.00,120
/// ```
///
/// # Errors
///
/// Returns a CSV error if the reader fails or the header cannot be read.
pub fn load_products<R: Read>(
    reader: R,
    catalog: &InMemoryCatalog,
    ledger: &InventoryLedger,
) -> Result<usize, csv::Error> {
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .has_headers(true)
        .from_reader(reader);

    let mut loaded = 0;
    for (line, result) in rdr.deserialize::<SeedRecord>().enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(row = line + 1, error = %e, "skipping malformed seed row");
                continue;
            }
        };

        if record.price < Decimal::ZERO {
            tracing::warn!(row = line + 1, product_id = record.product_id, "skipping negative price");
            continue;
        }

        let id = ProductId(record.product_id);
        if let Err(e) = ledger.restock(id, record.stock) {
            tracing::warn!(row = line + 1, product_id = %id, error = %e, "skipping unstockable row");
            continue;
        }
        catalog.upsert(Product {
            id,
            name: record.name,
            price: record.price,
        });
        loaded += 1;
    }

    tracing::info!(products = loaded, "seed data loaded");
    Ok(loaded)
}
