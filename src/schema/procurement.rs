//! 内置 schema：政府采购单明细（每个文档是一条采购单行项目）

use super::{default_allowed_stages, default_forbidden_stages, FieldKind, FieldSpec, SchemaReference};

pub const PURCHASE_ORDERS_VERSION: &str = "purchase_orders-2024.1";

pub fn purchase_orders() -> SchemaReference {
    use FieldKind::*;

    let fields = vec![
        // 标识
        FieldSpec::new("purchase_order_number", String, "Primary PO identifier"),
        FieldSpec::new("requisition_number", String, "Requisition ID"),
        FieldSpec::new("lpa_number", String, "Leveraged Procurement Agreement number"),
        FieldSpec::new("cal_card", Boolean, "Procurement card flag"),
        // 日期
        FieldSpec::new("dates.creation", Date, "Order creation date"),
        FieldSpec::new("dates.purchase", Date, "Purchase date (may be null)"),
        FieldSpec::new(
            "dates.fiscal_year",
            String,
            "Fiscal year in format \"YYYY-YYYY\" (e.g. \"2013-2014\")",
        ),
        FieldSpec::new(
            "dates.fiscal_year_start",
            Integer,
            "Starting fiscal year as integer (e.g. 2013), use for numeric comparisons",
        ),
        // 部门
        FieldSpec::new("department.name", String, "Full department name"),
        FieldSpec::new("department.normalized_name", String, "Standardized name for grouping"),
        // 采购方式
        FieldSpec::new(
            "acquisition.type",
            String,
            "\"IT Goods\", \"IT Services\", \"NON-IT Goods\", \"NON-IT Services\"",
        ),
        FieldSpec::new("acquisition.sub_type", String, "Additional subtype details"),
        FieldSpec::new("acquisition.method", String, "e.g. \"Leveraged Procurement Agreement\""),
        FieldSpec::new("acquisition.sub_method", String, "More specific contracting approach"),
        // 明细
        FieldSpec::new("item.name", String, "Short item name"),
        FieldSpec::new("item.description", String, "Full-text item description"),
        FieldSpec::new("item.quantity", Number, "Quantity ordered"),
        FieldSpec::new("item.unit_price", Number, "Price per unit (USD)"),
        FieldSpec::new(
            "item.total_price",
            Number,
            "Total line item price (can be negative for credits/returns, can be null)",
        ),
        // 供应商
        FieldSpec::new("supplier.name", String, "Supplier/vendor name"),
        FieldSpec::new("supplier.code", String, "Unique supplier identifier"),
        FieldSpec::new("supplier.address", String, "Full address"),
        FieldSpec::new("supplier.city", String, ""),
        FieldSpec::new("supplier.state", String, ""),
        FieldSpec::new("supplier.zip", String, ""),
        FieldSpec::new("supplier.location", GeoPoint, "{ type: \"Point\", coordinates: [lon, lat] }"),
        FieldSpec::new("supplier.qualifications", Array, "e.g. [\"DVBE\", \"Small Business\"]"),
        // UNSPSC 分类
        FieldSpec::new("classification.unspsc.segment.code", String, "e.g. \"43000000\""),
        FieldSpec::new("classification.unspsc.segment.title", String, "e.g. \"Information Technology\""),
        FieldSpec::new("classification.unspsc.family.code", String, "e.g. \"43210000\""),
        FieldSpec::new("classification.unspsc.family.title", String, "e.g. \"Software\""),
        FieldSpec::new("classification.unspsc.class.code", String, ""),
        FieldSpec::new("classification.unspsc.class.title", String, ""),
        FieldSpec::new("classification.unspsc.commodity.code", String, ""),
        FieldSpec::new("classification.unspsc.commodity.title", String, ""),
        // 导入元数据
        FieldSpec::new("metadata.source_file", String, "Original CSV filename"),
        FieldSpec::new("metadata.import_date", Date, "When imported"),
    ];

    let notes = [
        "item.total_price can be null: ALWAYS sum with {\"$sum\": {\"$ifNull\": [\"$item.total_price\", 0]}}",
        "item.total_price can be negative (credits, returns, refunds)",
        "Always use dates.creation for time-based queries; use $year/$month operators on it",
        "dates.fiscal_year is a STRING like \"2012-2013\"; dates.fiscal_year_start is an INTEGER like 2012",
        "\"fiscal year 2014\" means \"2013-2014\" (the fiscal year starting in 2013)",
        "item.total_price, item.unit_price, item.quantity are NUMBERS, never compare them with strings",
        "Use department.normalized_name for department grouping",
        "Treat each document as a line item; do NOT group by purchase_order_number unless distinct purchase orders are requested",
        "For total record counts use $count directly (no $group)",
    ];

    SchemaReference {
        version: PURCHASE_ORDERS_VERSION.to_string(),
        collection: "purchase_orders".to_string(),
        description: "Government purchase orders, one document per purchase-order line item.".to_string(),
        fields,
        allowed_stages: default_allowed_stages(),
        forbidden_stages: default_forbidden_stages(),
        notes: notes.iter().map(|s| s.to_string()).collect(),
    }
}
