use proc_macro::TokenStream;
use proc_macro2::{Literal, Span, TokenStream as TokenStream2};
use quote::{format_ident, quote};
use syn::{parse_macro_input, spanned::Spanned, Attribute, Data, DeriveInput, Fields, Ident, Type};

#[proc_macro_derive(NestedSetModel, attributes(nested_set))]
pub fn derive_nested_set_model(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match impl_nested_set_model(&input) {
        Ok(tokens) => tokens,
        Err(err) => err.to_compile_error().into(),
    }
}

#[derive(Default)]
struct Options {
    id_field: Option<String>,
    parent_field: Option<String>,
    lft_field: Option<String>,
    rgt_field: Option<String>,
    deleted_at_field: Option<String>,
    scope_fields: Vec<String>,
    root_policy: Option<String>,
    lock: Option<String>,
    lock_timeout_ms: Option<u64>,
    entity_name: Option<String>,
}

/// A model field the generated impl reads and writes.
struct FieldRef {
    name: String,
    ident: Ident,
    ty: Type,
    column: Ident,
}

fn impl_nested_set_model(input: &DeriveInput) -> syn::Result<TokenStream> {
    let struct_ident = &input.ident;

    let data_struct = match &input.data {
        Data::Struct(data) => data,
        _ => {
            return Err(syn::Error::new(
                input.span(),
                "NestedSetModel can only be derived for structs",
            ))
        }
    };

    let mut options = Options::default();
    let mut table_name: Option<String> = None;

    for attr in &input.attrs {
        if attr.path().is_ident("nested_set") {
            parse_nested_set_attr(attr, &mut options)?;
        }

        if attr.path().is_ident("sea_orm") {
            if let Some(name) = parse_sea_orm_table_name(attr)? {
                table_name = Some(name);
            }
        }
    }

    let fields = match &data_struct.fields {
        Fields::Named(fields) => fields,
        other => {
            return Err(syn::Error::new(
                other.span(),
                "NestedSetModel requires named fields",
            ))
        }
    };

    let lookup = |name: &str| -> syn::Result<FieldRef> {
        fields
            .named
            .iter()
            .find(|field| field.ident.as_ref().is_some_and(|ident| ident == name))
            .map(|field| FieldRef {
                name: name.to_string(),
                ident: Ident::new(name, struct_ident.span()),
                ty: field.ty.clone(),
                column: format_ident!("{}", to_pascal_case(name)),
            })
            .ok_or_else(|| {
                syn::Error::new(
                    struct_ident.span(),
                    format!("field `{name}` not found; set it in #[nested_set(...)]"),
                )
            })
    };

    let id = lookup(options.id_field.as_deref().unwrap_or("id"))?;
    let parent = lookup(options.parent_field.as_deref().unwrap_or("parent_id"))?;
    let lft = lookup(options.lft_field.as_deref().unwrap_or("lft"))?;
    let rgt = lookup(options.rgt_field.as_deref().unwrap_or("rgt"))?;
    let deleted_at = options.deleted_at_field.as_deref().map(lookup).transpose()?;
    let scope = options
        .scope_fields
        .iter()
        .map(|name| lookup(name))
        .collect::<syn::Result<Vec<_>>>()?;

    let table = table_name.ok_or_else(|| {
        syn::Error::new(
            struct_ident.span(),
            "NestedSetModel needs #[sea_orm(table_name = \"...\")]",
        )
    })?;
    let entity_name = options.entity_name.clone().unwrap_or_else(|| table.clone());

    let config = config_tokens(
        &options,
        &entity_name,
        &table,
        &id,
        &parent,
        &lft,
        &rgt,
        deleted_at.as_ref(),
        &scope,
    )?;

    let (id_ident, id_ty, id_column) = (&id.ident, &id.ty, &id.column);
    let (parent_ident, parent_ty, parent_column) = (&parent.ident, &parent.ty, &parent.column);
    let (lft_ident, lft_ty, lft_column) = (&lft.ident, &lft.ty, &lft.column);
    let (rgt_ident, rgt_ty, rgt_column) = (&rgt.ident, &rgt.ty, &rgt.column);

    let scope_idents: Vec<&Ident> = scope.iter().map(|field| &field.ident).collect();
    let scope_types: Vec<&Type> = scope.iter().map(|field| &field.ty).collect();
    let scope_columns: Vec<&Ident> = scope.iter().map(|field| &field.column).collect();
    let scope_names: Vec<&str> = scope.iter().map(|field| field.name.as_str()).collect();
    let scope_positions: Vec<Literal> = (0..scope.len()).map(Literal::usize_unsuffixed).collect();
    let scope_len = Literal::usize_unsuffixed(scope.len());
    let scope_unused = scope.is_empty().then(|| quote! { let _ = (active, values); });
    let scope_row_unused = scope.is_empty().then(|| quote! { let _ = row; });

    let (read_deleted_at, write_deleted_at, deleted_at_column) = match &deleted_at {
        Some(field) => {
            let (ident, ty, column) = (&field.ident, &field.ty, &field.column);
            (
                quote! { <#ty as ::nested_set::column::DeletedAtColumn>::to_marker(&self.#ident) },
                quote! {
                    active.#ident = ::sea_orm::ActiveValue::Set(
                        <#ty as ::nested_set::column::DeletedAtColumn>::from_marker(marker),
                    );
                },
                quote! { ::core::option::Option::Some(Column::#column) },
            )
        }
        None => (
            quote! { ::core::option::Option::None },
            quote! { let _ = (active, marker); },
            quote! { ::core::option::Option::None },
        ),
    };

    let generated = quote! {
        impl ::nested_set::NestedSetModel for #struct_ident {
            type Entity = Entity;
            type ActiveModel = ActiveModel;

            fn nested_set_config() -> &'static ::nested_set::NestedSetConfig {
                static CONFIG: ::nested_set::__private::Lazy<::nested_set::NestedSetConfig> =
                    ::nested_set::__private::Lazy::new(|| #config);
                &CONFIG
            }

            fn node_id(&self) -> ::nested_set::NodeId {
                ::nested_set::NodeId::new(
                    <#id_ty as ::nested_set::column::IntColumn>::to_i64(&self.#id_ident),
                )
            }

            fn to_node(&self) -> ::nested_set::Node {
                let scope_values: ::std::vec::Vec<::nested_set::ScopeValue> = ::std::vec![
                    #(<#scope_types as ::nested_set::column::ScopeColumn>::to_scope_value(&self.#scope_idents)),*
                ];
                ::nested_set::Node {
                    id: ::nested_set::NestedSetModel::node_id(self),
                    parent_id: <#parent_ty as ::nested_set::column::ParentColumn>::to_parent(&self.#parent_ident),
                    lft: <#lft_ty as ::nested_set::column::IntColumn>::to_i64(&self.#lft_ident),
                    rgt: <#rgt_ty as ::nested_set::column::IntColumn>::to_i64(&self.#rgt_ident),
                    scope: ::nested_set::Scope::new(scope_values),
                    deleted_at: #read_deleted_at,
                }
            }

            fn id_value(
                id: ::nested_set::NodeId,
            ) -> ::core::result::Result<::sea_orm::Value, ::nested_set::NestedSetError> {
                <#id_ty as ::nested_set::column::IntColumn>::from_i64(id.get())
                    .map(::sea_orm::Value::from)
            }

            fn set_id(
                active: &mut Self::ActiveModel,
                id: ::nested_set::NodeId,
            ) -> ::core::result::Result<(), ::nested_set::NestedSetError> {
                active.#id_ident = ::sea_orm::ActiveValue::Set(
                    <#id_ty as ::nested_set::column::IntColumn>::from_i64(id.get())?,
                );
                Ok(())
            }

            fn set_position(
                active: &mut Self::ActiveModel,
                slot: &::nested_set::NodeSlot,
            ) -> ::core::result::Result<(), ::nested_set::NestedSetError> {
                active.#parent_ident = ::sea_orm::ActiveValue::Set(
                    <#parent_ty as ::nested_set::column::ParentColumn>::from_parent(slot.parent_id)?,
                );
                active.#lft_ident = ::sea_orm::ActiveValue::Set(
                    <#lft_ty as ::nested_set::column::IntColumn>::from_i64(slot.lft)?,
                );
                active.#rgt_ident = ::sea_orm::ActiveValue::Set(
                    <#rgt_ty as ::nested_set::column::IntColumn>::from_i64(slot.rgt)?,
                );
                Ok(())
            }

            fn set_scope(
                active: &mut Self::ActiveModel,
                scope: &::nested_set::Scope,
            ) -> ::core::result::Result<(), ::nested_set::NestedSetError> {
                let values = scope.values();
                if values.len() != #scope_len {
                    return ::core::result::Result::Err(::nested_set::NestedSetError::invariant(::std::format!(
                        "scope {} does not match the {} scope column(s) of {}",
                        scope,
                        #scope_len,
                        <Self as ::nested_set::NestedSetModel>::nested_set_config().entity_name()
                    )));
                }
                #scope_unused
                #(
                    active.#scope_idents = ::sea_orm::ActiveValue::Set(
                        <#scope_types as ::nested_set::column::ScopeColumn>::from_scope_value(
                            &values[#scope_positions],
                        )?,
                    );
                )*
                Ok(())
            }

            fn set_deleted_at(
                active: &mut Self::ActiveModel,
                marker: ::core::option::Option<::nested_set::__private::DateTime<::nested_set::__private::Utc>>,
            ) {
                #write_deleted_at
            }

            fn scope_from_row(
                row: &::sea_orm::QueryResult,
            ) -> ::core::result::Result<::nested_set::Scope, ::sea_orm::DbErr> {
                #scope_row_unused
                let scope_values: ::std::vec::Vec<::nested_set::ScopeValue> = ::std::vec![
                    #(<#scope_types as ::nested_set::column::ScopeColumn>::to_scope_value(
                        &row.try_get::<#scope_types>("", #scope_names)?,
                    )),*
                ];
                Ok(::nested_set::Scope::new(scope_values))
            }

            fn id_column() -> <Self::Entity as ::sea_orm::EntityTrait>::Column {
                Column::#id_column
            }

            fn parent_column() -> <Self::Entity as ::sea_orm::EntityTrait>::Column {
                Column::#parent_column
            }

            fn lft_column() -> <Self::Entity as ::sea_orm::EntityTrait>::Column {
                Column::#lft_column
            }

            fn rgt_column() -> <Self::Entity as ::sea_orm::EntityTrait>::Column {
                Column::#rgt_column
            }

            fn deleted_at_column(
            ) -> ::core::option::Option<<Self::Entity as ::sea_orm::EntityTrait>::Column> {
                #deleted_at_column
            }

            fn scope_columns() -> ::std::vec::Vec<<Self::Entity as ::sea_orm::EntityTrait>::Column> {
                ::std::vec![#(Column::#scope_columns),*]
            }
        }
    };

    Ok(generated.into())
}

#[allow(clippy::too_many_arguments)]
fn config_tokens(
    options: &Options,
    entity_name: &str,
    table: &str,
    id: &FieldRef,
    parent: &FieldRef,
    lft: &FieldRef,
    rgt: &FieldRef,
    deleted_at: Option<&FieldRef>,
    scope: &[FieldRef],
) -> syn::Result<TokenStream2> {
    let span = Span::call_site();
    let lit = |value: &str| syn::LitStr::new(value, span);

    let entity_name = lit(entity_name);
    let table = lit(table);
    let id_column = lit(&id.name);
    let parent_column = lit(&parent.name);
    let lft_column = lit(&lft.name);
    let rgt_column = lit(&rgt.name);

    let mut extra = TokenStream2::new();
    if let Some(field) = deleted_at {
        let column = lit(&field.name);
        extra.extend(quote! { .deleted_at_column(#column) });
    }
    if !scope.is_empty() {
        let columns = scope.iter().map(|field| lit(&field.name));
        extra.extend(quote! { .scope_columns([#(#columns),*]) });
    }
    match options.root_policy.as_deref() {
        None | Some("multiple") => {}
        Some("single") => {
            extra.extend(quote! { .root_policy(::nested_set::RootPolicy::Single) });
        }
        Some(other) => {
            return Err(syn::Error::new(
                span,
                format!("Unsupported root_policy `{other}`; expected \"single\" or \"multiple\""),
            ))
        }
    }
    match options.lock.as_deref() {
        None => {}
        Some("disabled") => {
            extra.extend(quote! {
                .advisory_lock_strategy(::nested_set::AdvisoryLockStrategy::Disabled)
            });
        }
        Some(key) => {
            let key = lit(key);
            extra.extend(quote! {
                .advisory_lock_strategy(::nested_set::AdvisoryLockStrategy::Namespaced(
                    ::nested_set::AdvisoryLockKey::new(#key),
                ))
            });
        }
    }
    if let Some(millis) = options.lock_timeout_ms {
        extra.extend(quote! { .lock_timeout(::std::time::Duration::from_millis(#millis)) });
    }

    Ok(quote! {{
        let base = ::nested_set::NestedSetConfig::new(#entity_name, #table);
        ::nested_set::NestedSetOptions::default()
            .id_column(#id_column)
            .parent_column(#parent_column)
            .lft_column(#lft_column)
            .rgt_column(#rgt_column)
            #extra
            .apply(base)
    }})
}

fn parse_nested_set_attr(attr: &Attribute, options: &mut Options) -> syn::Result<()> {
    attr.parse_nested_meta(|meta| {
        let ident = meta
            .path
            .get_ident()
            .ok_or_else(|| syn::Error::new(meta.path.span(), "Invalid option key"))?
            .to_string();

        match ident.as_str() {
            "id_field" => {
                let value: syn::LitStr = meta.value()?.parse()?;
                options.id_field = Some(value.value());
            }
            "parent_field" => {
                let value: syn::LitStr = meta.value()?.parse()?;
                options.parent_field = Some(value.value());
            }
            "lft_field" => {
                let value: syn::LitStr = meta.value()?.parse()?;
                options.lft_field = Some(value.value());
            }
            "rgt_field" => {
                let value: syn::LitStr = meta.value()?.parse()?;
                options.rgt_field = Some(value.value());
            }
            "deleted_at_field" => {
                let value: syn::LitStr = meta.value()?.parse()?;
                options.deleted_at_field = Some(value.value());
            }
            "scope" => {
                let value: syn::LitStr = meta.value()?.parse()?;
                options.scope_fields = value
                    .value()
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "root_policy" => {
                let value: syn::LitStr = meta.value()?.parse()?;
                options.root_policy = Some(value.value());
            }
            "lock" => {
                let value: syn::LitStr = meta.value()?.parse()?;
                options.lock = Some(value.value());
            }
            "lock_timeout_ms" => {
                let value: syn::LitInt = meta.value()?.parse()?;
                options.lock_timeout_ms = Some(value.base10_parse()?);
            }
            "entity_name" => {
                let value: syn::LitStr = meta.value()?.parse()?;
                options.entity_name = Some(value.value());
            }
            other => {
                return Err(syn::Error::new(
                    meta.path.span(),
                    format!("Unsupported nested_set option `{other}`"),
                ));
            }
        }

        Ok(())
    })
}

fn parse_sea_orm_table_name(attr: &Attribute) -> syn::Result<Option<String>> {
    let mut table_name: Option<String> = None;
    attr.parse_nested_meta(|meta| {
        if meta.path.is_ident("table_name") {
            let value: syn::LitStr = meta.value()?.parse()?;
            table_name = Some(value.value());
        } else if meta.input.peek(syn::Token![=]) {
            // Other `key = value` options (schema_name, comment, ...).
            let _: syn::Expr = meta.value()?.parse()?;
        }
        Ok(())
    })?;
    Ok(table_name)
}

fn to_pascal_case(value: &str) -> String {
    value
        .split('_')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}
